//! Termination detection.
//!
//! Every process runs the same three-state echo protocol:
//!
//! 1. **NotTerminated**: on the first request, or on the first Terminate
//!    received, send Terminate on every outgoing channel to another process.
//!    If every non-self inbound channel is already terminated, send Terminate
//!    on the self-channel and go to WaitingForSelf; otherwise go to
//!    WaitingForNeighbours.
//! 2. **WaitingForNeighbours**: mark each inbound channel a Terminate arrives
//!    on. Once all non-self inbound channels are terminated, send on the
//!    self-channel and go to WaitingForSelf.
//! 3. **WaitingForSelf**: the self-addressed Terminate finishes the protocol.
//!
//! The body runs under a per-process lock so that a controller-thread request
//! and the receive loop never race on the inbound completeness count. Every
//! process must own exactly one self-channel.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use dsim_common::{ChannelId, Message, MessageType, ProcessId};
use log::{debug, warn};

use crate::{
    channel::Channel,
    clock::LogicalClock,
    error::{Result, SimError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TerminationStatus {
    #[default]
    NotTerminated,
    WaitingForNeighbours,
    WaitingForSelf,
}

impl fmt::Display for TerminationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTerminated => f.write_str("NotTerminated"),
            Self::WaitingForNeighbours => f.write_str("WaitingForNeighbours"),
            Self::WaitingForSelf => f.write_str("WaitingForSelf"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelStatus {
    #[default]
    NotTerminated,
    Terminated,
}

/// What drives a protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationTrigger {
    /// Terminate was requested by the algorithm or the controller.
    Request,
    /// A Terminate message arrived on the given inbound channel.
    Received(ChannelId),
}

#[derive(Debug)]
pub struct TerminationProtocol {
    process: ProcessId,
    status: Mutex<TerminationStatus>,
}

impl TerminationProtocol {
    #[must_use]
    pub const fn new(process: ProcessId) -> Self {
        Self {
            process,
            status: Mutex::new(TerminationStatus::NotTerminated),
        }
    }

    #[must_use]
    pub fn status(&self) -> TerminationStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one protocol step.
    ///
    /// Returns `Ok(true)` once the self-addressed Terminate has been received
    /// in WaitingForSelf; the receive loop must then stop.
    pub fn step(
        &self,
        trigger: TerminationTrigger,
        incoming: &[Arc<Channel>],
        outgoing: &[Arc<Channel>],
        clock: &LogicalClock,
    ) -> Result<bool> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);

        if let TerminationTrigger::Received(channel_id) = trigger {
            let channel = incoming
                .iter()
                .find(|c| c.id() == channel_id)
                .ok_or_else(|| {
                    SimError::protocol(
                        format!("Terminate arrived on unknown channel {channel_id}"),
                        Some(self.process),
                    )
                })?;

            if channel.is_self() {
                if *status == TerminationStatus::WaitingForSelf {
                    debug!("p{}: self Terminate received, protocol finished", self.process);
                    return Ok(true);
                }
                return Err(SimError::protocol(
                    format!("self-addressed Terminate received while {}", *status),
                    Some(self.process),
                ));
            }

            channel.mark_terminated();
            debug!(
                "p{}: channel {} from p{} terminated",
                self.process,
                channel.id(),
                channel.source()
            );
        }

        match *status {
            TerminationStatus::NotTerminated => {
                for channel in outgoing.iter().filter(|c| !c.is_self()) {
                    self.send_terminate(channel, clock);
                }
                *status = if self.neighbours_done(incoming) {
                    self.send_self_terminate(outgoing, clock)?;
                    TerminationStatus::WaitingForSelf
                } else {
                    TerminationStatus::WaitingForNeighbours
                };
            }
            TerminationStatus::WaitingForNeighbours => {
                if self.neighbours_done(incoming) {
                    self.send_self_terminate(outgoing, clock)?;
                    *status = TerminationStatus::WaitingForSelf;
                }
            }
            TerminationStatus::WaitingForSelf => {
                if let TerminationTrigger::Received(channel_id) = trigger {
                    warn!(
                        "p{}: late Terminate on channel {channel_id} while waiting for self",
                        self.process
                    );
                }
            }
        }
        debug!("p{}: termination status {}", self.process, *status);
        Ok(false)
    }

    fn neighbours_done(&self, incoming: &[Arc<Channel>]) -> bool {
        incoming
            .iter()
            .filter(|c| !c.is_self())
            .all(|c| c.is_terminated())
    }

    fn send_self_terminate(&self, outgoing: &[Arc<Channel>], clock: &LogicalClock) -> Result<()> {
        let channel = outgoing.iter().find(|c| c.is_self()).ok_or_else(|| {
            SimError::topology(format!("process {} has no self-channel", self.process))
        })?;
        self.send_terminate(channel, clock);
        Ok(())
    }

    fn send_terminate(&self, channel: &Channel, clock: &LogicalClock) {
        let mut message = Message::on_route(MessageType::Terminate, channel.route());
        message.header.logical_clock = Some(clock.tick());
        if let Err(e) = channel.transmit(message) {
            warn!("p{}: failed to send Terminate: {e}", self.process);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::*;

    struct Fixture {
        incoming: Vec<Arc<Channel>>,
        outgoing: Vec<Arc<Channel>>,
        receivers: Vec<(ProcessId, UnboundedReceiver<Message>)>,
    }

    /// Process 0 with a self-channel and symmetric links to `peers`.
    fn fixture(peers: &[ProcessId]) -> Fixture {
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        let mut receivers = Vec::new();
        let mut next_id = 0;

        let mut link = |dest: ProcessId, out: &mut Vec<Arc<Channel>>| {
            let ch = Arc::new(Channel::new(next_id, 0, dest));
            next_id += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            ch.attach(tx);
            receivers.push((dest, rx));
            out.push(Arc::clone(&ch));
            ch
        };
        let self_channel = link(0, &mut outgoing);
        incoming.push(self_channel);
        for &peer in peers {
            link(peer, &mut outgoing);
        }
        for (i, &peer) in peers.iter().enumerate() {
            incoming.push(Arc::new(Channel::new(100 + i as u32, peer, 0)));
        }
        Fixture {
            incoming,
            outgoing,
            receivers,
        }
    }

    fn drain(fx: &mut Fixture) -> Vec<ProcessId> {
        let mut sent = Vec::new();
        for (dest, rx) in &mut fx.receivers {
            while let Ok(msg) = rx.try_recv() {
                assert!(msg.is_terminate());
                sent.push(*dest);
            }
        }
        sent.sort_unstable();
        sent
    }

    #[test]
    fn test_request_waits_for_neighbours_before_self() {
        let mut fx = fixture(&[1, 2]);
        let clock = LogicalClock::new();
        let protocol = TerminationProtocol::new(0);

        let done = protocol
            .step(TerminationTrigger::Request, &fx.incoming, &fx.outgoing, &clock)
            .unwrap();
        assert!(!done);
        assert_eq!(protocol.status(), TerminationStatus::WaitingForNeighbours);
        assert_eq!(drain(&mut fx), vec![1, 2]);

        protocol
            .step(TerminationTrigger::Received(100), &fx.incoming, &fx.outgoing, &clock)
            .unwrap();
        // Still one neighbour outstanding
        assert_eq!(protocol.status(), TerminationStatus::WaitingForNeighbours);
        assert!(drain(&mut fx).is_empty());

        protocol
            .step(TerminationTrigger::Received(101), &fx.incoming, &fx.outgoing, &clock)
            .unwrap();
        assert_eq!(protocol.status(), TerminationStatus::WaitingForSelf);
        assert_eq!(drain(&mut fx), vec![0]);

        let self_id = fx.incoming[0].id();
        assert!(protocol
            .step(TerminationTrigger::Received(self_id), &fx.incoming, &fx.outgoing, &clock)
            .unwrap());
    }

    #[test]
    fn test_received_terminate_from_last_neighbour_goes_straight_to_self() {
        let mut fx = fixture(&[1]);
        let clock = LogicalClock::new();
        let protocol = TerminationProtocol::new(0);

        protocol
            .step(TerminationTrigger::Received(100), &fx.incoming, &fx.outgoing, &clock)
            .unwrap();
        assert_eq!(protocol.status(), TerminationStatus::WaitingForSelf);
        assert_eq!(drain(&mut fx), vec![0, 1]);
    }

    #[test]
    fn test_isolated_process_terminates_via_self_channel_only() {
        let mut fx = fixture(&[]);
        let clock = LogicalClock::new();
        let protocol = TerminationProtocol::new(0);

        protocol
            .step(TerminationTrigger::Request, &fx.incoming, &fx.outgoing, &clock)
            .unwrap();
        assert_eq!(protocol.status(), TerminationStatus::WaitingForSelf);
        assert_eq!(drain(&mut fx), vec![0]);
    }

    #[test]
    fn test_never_waits_for_self_while_inbound_open() {
        let fx = fixture(&[1, 2, 3]);
        let clock = LogicalClock::new();
        let protocol = TerminationProtocol::new(0);

        for trigger in [
            TerminationTrigger::Request,
            TerminationTrigger::Received(102),
            TerminationTrigger::Request,
            TerminationTrigger::Received(100),
        ] {
            protocol
                .step(trigger, &fx.incoming, &fx.outgoing, &clock)
                .unwrap();
            let open = fx
                .incoming
                .iter()
                .any(|c| !c.is_self() && !c.is_terminated());
            if open {
                assert_ne!(protocol.status(), TerminationStatus::WaitingForSelf);
            }
        }
        assert_eq!(protocol.status(), TerminationStatus::WaitingForNeighbours);
    }

    #[test]
    fn test_early_self_terminate_is_rejected() {
        let fx = fixture(&[1]);
        let clock = LogicalClock::new();
        let protocol = TerminationProtocol::new(0);
        let self_id = fx.incoming[0].id();

        assert!(protocol
            .step(TerminationTrigger::Received(self_id), &fx.incoming, &fx.outgoing, &clock)
            .is_err());
        assert!(protocol
            .step(TerminationTrigger::Received(999), &fx.incoming, &fx.outgoing, &clock)
            .is_err());
        assert_eq!(protocol.status(), TerminationStatus::NotTerminated);
    }
}
