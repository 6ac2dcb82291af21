//! The seam between the engine and algorithm code.
//!
//! An algorithm implements [`Algorithm`] and ships an [`AlgorithmFactory`]
//! that the [`AlgorithmRegistry`] resolves by name when a network is built.
//! One algorithm value is created per process and owned by its thread.
//!
//! Hooks never act on the network directly: sends and termination requests
//! made through [`ProcessContext`] are buffered and carried out by the engine
//! once the hook returns.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use dsim_common::{FieldValue, Message, ProcessId};

use crate::{
    algorithms::{FloodingFactory, PingPongFactory},
    error::{Result, SimError},
    events::{EventTables, TargetSelection, TriggeredMessage},
    observer::{Element, Observer},
    process::ProcessShared,
    queue::QueueDiscipline,
    termination::TerminationStatus,
    topology::{ProcessSpec, Topology, TopologyIssue},
};

/// Algorithm parameters taken from the topology configuration.
pub type Params = BTreeMap<String, FieldValue>;

/// Per-process algorithm behaviour.
///
/// The [`QueueDiscipline`] supertrait supplies the `arrange` and
/// `processing_condition` queue hooks; both default to FIFO delivery.
pub trait Algorithm: QueueDiscipline + Send {
    /// Called once on an initiator after its activation is released.
    fn run_algorithm(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()>;

    /// Called for every delivered message other than Terminate.
    fn receive_handling(&mut self, ctx: &mut ProcessContext<'_>, message: &Message) -> Result<()>;

    /// Runs before a message is handed to the transport. The message already
    /// carries its route and round.
    fn before_send_operation(&mut self, _ctx: &mut ProcessContext<'_>, _message: &mut Message) {}

    fn after_send_operation(&mut self, _ctx: &mut ProcessContext<'_>, _message: &Message) {}

    /// Builds the message a base-algorithm event sends to `target`.
    fn build_message(
        &mut self,
        ctx: &mut ProcessContext<'_>,
        template: &TriggeredMessage,
        _target: ProcessId,
    ) -> Message {
        template.instantiate(ctx.round())
    }

    /// Callback registered in the internal-events table.
    fn internal_event(&mut self, _ctx: &mut ProcessContext<'_>, _callback: &str, _message: &Message) {}
}

/// Deferred effect requested by algorithm code.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Send {
        dest: ProcessId,
        message: Message,
        events: bool,
    },
    SendToTargets {
        message: Message,
        targets: TargetSelection,
        events: bool,
    },
    Terminate,
}

/// The view of its process handed to every algorithm hook.
pub struct ProcessContext<'a> {
    shared: &'a ProcessShared,
    observer: &'a dyn Observer,
    actions: Vec<Action>,
}

impl fmt::Debug for ProcessContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process", &self.shared.id())
            .field("actions", &self.actions)
            .finish_non_exhaustive()
    }
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(shared: &'a ProcessShared, observer: &'a dyn Observer) -> Self {
        Self {
            shared,
            observer,
            actions: Vec::new(),
        }
    }

    pub(crate) fn into_actions(self) -> Vec<Action> {
        self.actions
    }

    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.shared.id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.shared.is_initiator()
    }

    #[must_use]
    pub fn round(&self) -> i64 {
        self.shared.round()
    }

    pub fn set_round(&mut self, round: i64) {
        self.shared.set_round(round);
    }

    /// Increments the round and returns the new value.
    pub fn increment_round(&mut self) -> i64 {
        let round = self.shared.round() + 1;
        self.shared.set_round(round);
        round
    }

    /// Outgoing neighbours, sorted, without self.
    #[must_use]
    pub fn neighbours(&self) -> Vec<ProcessId> {
        self.shared.neighbours()
    }

    /// Sources of the non-self inbound channels, sorted.
    #[must_use]
    pub fn inbound_neighbours(&self) -> Vec<ProcessId> {
        self.shared.inbound_neighbours()
    }

    #[must_use]
    pub fn termination_status(&self) -> TerminationStatus {
        self.shared.termination_status()
    }

    /// Sends `message` on every outgoing channel to `dest`.
    ///
    /// A message without a round is stamped with the current round.
    pub fn send(&mut self, dest: ProcessId, message: Message) {
        self.actions.push(Action::Send {
            dest,
            message,
            events: true,
        });
    }

    /// Same as [`send`](Self::send) but no event trigger fires.
    pub fn send_with_no_events(&mut self, dest: ProcessId, message: Message) {
        self.actions.push(Action::Send {
            dest,
            message,
            events: false,
        });
    }

    /// Sends one copy of `message` to every selected neighbour.
    pub fn send_to_targets(&mut self, message: Message, targets: TargetSelection) {
        self.actions.push(Action::SendToTargets {
            message,
            targets,
            events: true,
        });
    }

    pub fn send_to_targets_with_no_events(&mut self, message: Message, targets: TargetSelection) {
        self.actions.push(Action::SendToTargets {
            message,
            targets,
            events: false,
        });
    }

    /// Starts the termination protocol once the current hook returns.
    pub fn terminate(&mut self) {
        self.actions.push(Action::Terminate);
    }

    /// Publishes a presentation value for this process.
    pub fn present(&self, key: &str, value: impl Into<FieldValue>) {
        self.observer
            .presentation_changed(Element::Process(self.id()), key, &value.into());
    }
}

/// Builds the per-process algorithm values of one algorithm.
pub trait AlgorithmFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, process: &ProcessSpec, params: &Params) -> Result<Box<dyn Algorithm>>;

    /// Structural constraints of the algorithm, reported next to the generic
    /// check-phase issues.
    fn check_topology(&self, _topology: &Topology) -> Vec<TopologyIssue> {
        Vec::new()
    }

    /// Event tables installed on every process of the network.
    fn event_tables(&self, _topology: &Topology, _params: &Params) -> EventTables {
        EventTables::new()
    }
}

/// Maps algorithm names to their factories.
#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    factories: HashMap<String, Arc<dyn AlgorithmFactory>>,
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.names())
            .finish()
    }
}

impl AlgorithmRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the algorithms shipped with the engine.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PingPongFactory));
        registry.register(Arc::new(FloodingFactory));
        registry
    }

    /// Adds a factory, replacing any previous one with the same name.
    pub fn register(&mut self, factory: Arc<dyn AlgorithmFactory>) {
        self.factories.insert(factory.name().to_owned(), factory);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AlgorithmFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| {
            SimError::config(format!(
                "unknown algorithm '{name}', known: {}",
                self.names().join(", ")
            ))
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_resolves_by_name() {
        let registry = AlgorithmRegistry::builtin();
        assert_eq!(registry.names(), vec!["flooding", "ping_pong"]);
        assert_eq!(registry.resolve("ping_pong").unwrap().name(), "ping_pong");

        let Err(err) = registry.resolve("paxos") else {
            panic!("paxos should not resolve");
        };
        assert!(err.to_string().contains("unknown algorithm 'paxos'"));
    }
}
