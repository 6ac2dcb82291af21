//! Two-party round counter.
//!
//! The initiator sends `Forwarded` with round 0. The responder increments its
//! round on every `Forwarded` and answers with its new round. Once its round
//! reaches the limit it sends `LastMessage` instead, and the initiator
//! terminates.

use dsim_common::{FieldValue, Message, MessageType};
use log::debug;

use crate::{
    algorithm::{Algorithm, AlgorithmFactory, Params, ProcessContext},
    error::{Result, SimError},
    events::TargetSelection,
    queue::QueueDiscipline,
    topology::{Correction, ProcessSpec, Topology, TopologyIssue},
};

/// Round at which the responder stops when `rounds` is not configured.
pub const DEFAULT_ROUNDS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    rounds: i64,
}

impl PingPong {
    #[must_use]
    pub const fn new(rounds: i64) -> Self {
        Self { rounds }
    }
}

impl QueueDiscipline for PingPong {}

impl Algorithm for PingPong {
    fn run_algorithm(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        let ping = Message::new(MessageType::Forwarded).with_round(ctx.round());
        ctx.send_to_targets(ping, TargetSelection::All);
        Ok(())
    }

    fn receive_handling(&mut self, ctx: &mut ProcessContext<'_>, message: &Message) -> Result<()> {
        let Some(peer) = message.source_process() else {
            return Err(SimError::protocol("message without source", Some(ctx.id())));
        };

        match (&message.message_type, ctx.is_initiator()) {
            (MessageType::Forwarded, false) => {
                let round = ctx.increment_round();
                ctx.present("round", round);
                let reply = if round >= self.rounds {
                    debug!("p{}: round {round} reached, sending last message", ctx.id());
                    MessageType::LastMessage
                } else {
                    MessageType::Forwarded
                };
                ctx.send(peer, Message::derived_from(message, reply).with_round(round));
            }
            (MessageType::Forwarded, true) => {
                let round = message.round().unwrap_or_default();
                ctx.set_round(round);
                ctx.present("round", round);
                ctx.send(peer, Message::derived_from(message, MessageType::Forwarded));
            }
            (MessageType::LastMessage, true) => {
                ctx.present("finished", true);
                ctx.terminate();
            }
            (other, _) => {
                return Err(SimError::protocol(
                    format!("unexpected {other} from p{peer}"),
                    Some(ctx.id()),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PingPongFactory;

impl AlgorithmFactory for PingPongFactory {
    fn name(&self) -> &str {
        "ping_pong"
    }

    fn create(&self, _process: &ProcessSpec, params: &Params) -> Result<Box<dyn Algorithm>> {
        let rounds = match params.get("rounds") {
            None => DEFAULT_ROUNDS,
            Some(value) => value
                .as_int()
                .filter(|&r| r > 0)
                .ok_or_else(|| SimError::config(format!("rounds must be a positive integer, got {value}")))?,
        };
        Ok(Box::new(PingPong::new(rounds)))
    }

    /// Every channel leaving an initiator needs a reply channel.
    fn check_topology(&self, topology: &Topology) -> Vec<TopologyIssue> {
        let mut issues = Vec::new();
        for initiator in topology.initiators() {
            for channel in topology.outgoing(initiator).filter(|c| !c.is_self()) {
                let answered = topology
                    .outgoing(channel.dest)
                    .any(|back| back.dest == initiator);
                if !answered {
                    issues.push(TopologyIssue::Algorithm {
                        message: format!(
                            "ping_pong: p{} cannot answer initiator p{initiator}",
                            channel.dest
                        ),
                        correction: Correction::AddChannel {
                            source: channel.dest,
                            dest: initiator,
                        },
                    });
                }
            }
        }
        issues
    }
}

/// Parameters setting the round limit.
#[must_use]
pub fn rounds_param(rounds: i64) -> Params {
    Params::from([("rounds".to_owned(), FieldValue::Int(rounds))])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_reads_rounds() {
        let spec = ProcessSpec {
            id: 0,
            name: "p0".to_owned(),
            initiator: true,
            receive_port: 0,
        };
        assert!(PingPongFactory.create(&spec, &Params::new()).is_ok());
        assert!(PingPongFactory.create(&spec, &rounds_param(3)).is_ok());
        assert!(PingPongFactory.create(&spec, &rounds_param(0)).is_err());
    }

    #[test]
    fn test_directed_topology_needs_reply_channel() {
        let mut t = Topology::new(true, true);
        t.add_process(0).unwrap();
        t.add_process(1).unwrap();
        t.set_initiator(0, true).unwrap();
        t.connect(0, 1).unwrap();

        let issues = PingPongFactory.check_topology(&t);
        assert_eq!(issues.len(), 1);
        t.apply(&issues[0].correction()).unwrap();
        assert!(PingPongFactory.check_topology(&t).is_empty());
    }
}
