//! Broadcast by flooding with echo collection.
//!
//! The initiator floods `Forwarded` to its neighbours. The first `Forwarded`
//! a process sees makes the sender its parent, and the process floods on to
//! every other neighbour. A process counts a `Forwarded` from a non-parent or
//! a `Backward` as one echo. Once it has an echo from every neighbour it
//! flooded to, it sends `Backward` to its parent. The initiator terminates when
//! all its echoes are in.

use dsim_common::{Message, MessageType, ProcessId};
use log::debug;

use crate::{
    algorithm::{Algorithm, AlgorithmFactory, Params, ProcessContext},
    error::{Result, SimError},
    events::TargetSelection,
    queue::QueueDiscipline,
    topology::{Correction, ProcessSpec, Topology, TopologyIssue},
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Flooding {
    parent: Option<ProcessId>,
    visited: bool,
    pending: usize,
}

impl Flooding {
    /// Floods to every neighbour but `parent` and returns how many were
    /// reached.
    fn flood(&mut self, ctx: &mut ProcessContext<'_>, parent: Option<ProcessId>) -> usize {
        let targets = TargetSelection::Exclude(parent.into_iter().collect());
        let count = targets.resolve(&ctx.neighbours(), ctx.id()).len();
        let hops = ctx.round() + 1;
        ctx.send_to_targets(
            Message::new(MessageType::Forwarded)
                .with_round(hops)
                .with_field("origin", i64::from(ctx.id())),
            targets,
        );
        self.visited = true;
        self.parent = parent;
        self.pending = count;
        count
    }

    fn echo_received(&mut self, ctx: &mut ProcessContext<'_>) {
        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            self.complete(ctx);
        }
    }

    fn complete(&mut self, ctx: &mut ProcessContext<'_>) {
        match self.parent {
            Some(parent) => {
                debug!("p{}: echo complete, answering p{parent}", ctx.id());
                ctx.send(parent, Message::new(MessageType::Backward));
            }
            None => {
                debug!("p{}: wave decided", ctx.id());
                ctx.present("decided", true);
                ctx.terminate();
            }
        }
    }
}

impl QueueDiscipline for Flooding {}

impl Algorithm for Flooding {
    fn run_algorithm(&mut self, ctx: &mut ProcessContext<'_>) -> Result<()> {
        if self.flood(ctx, None) == 0 {
            self.complete(ctx);
        }
        Ok(())
    }

    fn receive_handling(&mut self, ctx: &mut ProcessContext<'_>, message: &Message) -> Result<()> {
        let Some(source) = message.source_process() else {
            return Err(SimError::protocol("message without source", Some(ctx.id())));
        };
        match message.message_type {
            MessageType::Forwarded if !self.visited => {
                ctx.set_round(message.round().unwrap_or_default());
                ctx.present("parent", i64::from(source));
                if self.flood(ctx, Some(source)) == 0 {
                    self.complete(ctx);
                }
            }
            MessageType::Forwarded | MessageType::Backward => self.echo_received(ctx),
            ref other => {
                return Err(SimError::protocol(
                    format!("unexpected {other} from p{source}"),
                    Some(ctx.id()),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FloodingFactory;

impl AlgorithmFactory for FloodingFactory {
    fn name(&self) -> &str {
        "flooding"
    }

    fn create(&self, _process: &ProcessSpec, _params: &Params) -> Result<Box<dyn Algorithm>> {
        Ok(Box::new(Flooding::default()))
    }

    /// Echoes travel back along every link, so directed networks still need
    /// both directions.
    fn check_topology(&self, topology: &Topology) -> Vec<TopologyIssue> {
        if !topology.directed() {
            // The generic check already covers undirected networks
            return Vec::new();
        }
        topology
            .channels()
            .iter()
            .filter(|c| !c.is_self())
            .filter(|c| !topology.outgoing(c.dest).any(|r| r.dest == c.source))
            .map(|c| TopologyIssue::Algorithm {
                message: format!("flooding: channel {} has no way back", c.id),
                correction: Correction::AddChannel {
                    source: c.dest,
                    dest: c.source,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directed_network_needs_reverse_links() {
        let mut t = Topology::new(true, true);
        for id in 0..3 {
            t.add_process(id).unwrap();
        }
        t.connect(0, 1).unwrap();
        t.connect(1, 2).unwrap();
        t.connect(2, 1).unwrap();

        let issues = FloodingFactory.check_topology(&t);
        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].correction(),
            Correction::AddChannel { source: 1, dest: 0 }
        );
        assert!(FloodingFactory
            .check_topology(&Topology::new(false, true))
            .is_empty());
    }
}
