//! Breakpoints evaluated at every message dequeue.
//!
//! A breakpoint is a predicate over the current simulation state. The engine
//! attaches one to the network, one to every process, one to every channel and
//! one message-level slot per process. The controller edits the condition at
//! any time, including while a process is held on it.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use dsim_common::{ChannelId, Message, ProcessId};

use crate::termination::{ChannelStatus, TerminationStatus};

/// Phase in which a breakpoint is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Evaluated by a process on a dequeued message.
    Running,
    /// Evaluated by the controller outside the receive loop.
    Checking,
}

/// Network-wide facts visible to breakpoint conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub directed: bool,
    pub centralized: bool,
    pub process_count: usize,
    pub channel_count: usize,
}

/// Snapshot of the evaluating process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: String,
    pub initiator: bool,
    pub round: i64,
    pub termination_status: TerminationStatus,
    pub queue_len: usize,
}

/// Snapshot of the channel a message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub source: ProcessId,
    pub dest: ProcessId,
    pub termination_status: ChannelStatus,
}

/// Everything a condition may inspect.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointContext<'a> {
    pub mode: EvaluationMode,
    pub network: &'a NetworkInfo,
    pub process: &'a ProcessInfo,
    pub channel: Option<&'a ChannelInfo>,
    pub message: &'a Message,
}

pub type Condition = Arc<dyn Fn(&BreakpointContext<'_>) -> bool + Send + Sync>;

/// Element a breakpoint is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointTarget {
    Network,
    Process(ProcessId),
    Channel(ChannelId),
    /// Message-level slot of a process.
    Message(ProcessId),
}

impl fmt::Display for BreakpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Process(id) => write!(f, "process {id}"),
            Self::Channel(id) => write!(f, "channel {id}"),
            Self::Message(id) => write!(f, "messages of process {id}"),
        }
    }
}

/// A breakpoint that evaluated true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    pub target: BreakpointTarget,
    pub label: String,
    pub single_step: bool,
}

pub struct Breakpoint {
    target: BreakpointTarget,
    label: RwLock<String>,
    condition: RwLock<Option<Condition>>,
    single_step: AtomicBool,
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("target", &self.target)
            .field("label", &self.label())
            .field("armed", &self.is_armed())
            .finish_non_exhaustive()
    }
}

impl Breakpoint {
    #[must_use]
    pub fn new(target: BreakpointTarget) -> Self {
        Self {
            target,
            label: RwLock::new(String::new()),
            condition: RwLock::new(None),
            single_step: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn target(&self) -> BreakpointTarget {
        self.target
    }

    #[must_use]
    pub fn label(&self) -> String {
        self.label
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs a condition, replacing any previous one.
    pub fn set_condition<F>(&self, label: impl Into<String>, condition: F)
    where
        F: Fn(&BreakpointContext<'_>) -> bool + Send + Sync + 'static,
    {
        *self.label.write().unwrap_or_else(PoisonError::into_inner) = label.into();
        *self.condition.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(condition));
    }

    pub fn clear(&self) {
        *self.condition.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.single_step.store(false, Ordering::Release);
    }

    /// Makes the next evaluation true, once.
    pub fn single_step(&self) {
        self.single_step.store(true, Ordering::Release);
    }

    /// True when a condition is installed or a single step is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.single_step.load(Ordering::Acquire)
            || self
                .condition
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    /// Evaluates the breakpoint against the current state.
    pub fn evaluate(
        &self,
        mode: EvaluationMode,
        network: &NetworkInfo,
        process: &ProcessInfo,
        channel: Option<&ChannelInfo>,
        message: &Message,
    ) -> bool {
        self.check(mode, network, process, channel, message).is_some()
    }

    /// Same as [`evaluate`](Self::evaluate) but describes the hit.
    pub fn check(
        &self,
        mode: EvaluationMode,
        network: &NetworkInfo,
        process: &ProcessInfo,
        channel: Option<&ChannelInfo>,
        message: &Message,
    ) -> Option<BreakpointHit> {
        if self.single_step.swap(false, Ordering::AcqRel) {
            return Some(BreakpointHit {
                target: self.target,
                label: "single step".to_owned(),
                single_step: true,
            });
        }

        // Clone out so the condition runs without holding the lock
        let condition = self
            .condition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let ctx = BreakpointContext {
            mode,
            network,
            process,
            channel,
            message,
        };
        condition(&ctx).then(|| BreakpointHit {
            target: self.target,
            label: self.label(),
            single_step: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use dsim_common::MessageType;

    use super::*;

    fn fixtures() -> (NetworkInfo, ProcessInfo, Message) {
        (
            NetworkInfo {
                directed: false,
                centralized: true,
                process_count: 2,
                channel_count: 4,
            },
            ProcessInfo {
                id: 1,
                name: "p1".into(),
                initiator: false,
                round: 3,
                termination_status: TerminationStatus::NotTerminated,
                queue_len: 1,
            },
            Message::new(MessageType::Forwarded).with_round(3),
        )
    }

    #[test]
    fn test_unarmed_breakpoint_never_holds() {
        let (net, proc_, msg) = fixtures();
        let bp = Breakpoint::new(BreakpointTarget::Network);
        assert!(!bp.is_armed());
        assert!(!bp.evaluate(EvaluationMode::Running, &net, &proc_, None, &msg));
    }

    #[test]
    fn test_single_step_holds_exactly_once() {
        let (net, proc_, msg) = fixtures();
        let bp = Breakpoint::new(BreakpointTarget::Process(1));
        bp.single_step();
        let hit = bp
            .check(EvaluationMode::Running, &net, &proc_, None, &msg)
            .unwrap();
        assert!(hit.single_step);
        assert!(!bp.evaluate(EvaluationMode::Running, &net, &proc_, None, &msg));
    }

    #[test]
    fn test_condition_sees_state_and_can_be_replaced() {
        let (net, proc_, msg) = fixtures();
        let bp = Breakpoint::new(BreakpointTarget::Message(1));
        bp.set_condition("round three", |ctx| ctx.message.round() == Some(3));
        let hit = bp
            .check(EvaluationMode::Running, &net, &proc_, None, &msg)
            .unwrap();
        assert_eq!(hit.label, "round three");
        assert_eq!(hit.target, BreakpointTarget::Message(1));

        bp.set_condition("initiator only", |ctx| ctx.process.initiator);
        assert!(!bp.evaluate(EvaluationMode::Running, &net, &proc_, None, &msg));

        bp.clear();
        assert!(!bp.is_armed());
    }
}
