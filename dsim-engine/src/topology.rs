//! Design-time description of a network and its check phase.
//!
//! A [`Topology`] is built with `add_process`/`add_channel`/`connect` (or from
//! a [`TopologyConfig`]) and then checked. Each [`TopologyIssue`] found by
//! [`Topology::check`] carries a [`Correction`]. The caller decides whether to
//! apply it, or calls [`Topology::repair`] to apply every correction.

use std::{collections::BTreeSet, fmt};

use dsim::TopologyConfig;
use dsim_common::{ChannelId, ProcessId};
use log::info;

use crate::error::{Result, SimError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub id: ProcessId,
    pub name: String,
    pub initiator: bool,
    /// Listener port; 0 lets the OS choose at instantiation.
    pub receive_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub source: ProcessId,
    pub dest: ProcessId,
}

impl ChannelSpec {
    #[must_use]
    pub const fn is_self(&self) -> bool {
        self.source == self.dest
    }
}

/// Automatic fix for a [`TopologyIssue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    AddChannel { source: ProcessId, dest: ProcessId },
    RemoveChannels(Vec<ChannelId>),
    SetInitiator { process: ProcessId, initiator: bool },
    /// Clears the initiator flag on every process but `process`.
    KeepOnlyInitiator(ProcessId),
}

impl fmt::Display for Correction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddChannel { source, dest } => write!(f, "add channel {source}->{dest}"),
            Self::RemoveChannels(ids) => write!(f, "remove channels {ids:?}"),
            Self::SetInitiator { process, initiator } => {
                write!(f, "set initiator={initiator} on process {process}")
            }
            Self::KeepOnlyInitiator(process) => {
                write!(f, "keep process {process} as the only initiator")
            }
        }
    }
}

/// Structural problem found by the check phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyIssue {
    MissingReverseChannel {
        channel: ChannelId,
        source: ProcessId,
        dest: ProcessId,
    },
    MissingSelfChannel {
        process: ProcessId,
    },
    DuplicateSelfChannel {
        process: ProcessId,
        extra: Vec<ChannelId>,
    },
    MissingInitiator {
        candidate: ProcessId,
    },
    MultipleInitiators {
        processes: Vec<ProcessId>,
    },
    /// Constraint reported by the algorithm factory.
    Algorithm {
        message: String,
        correction: Correction,
    },
}

impl TopologyIssue {
    /// The correction that resolves this issue.
    #[must_use]
    pub fn correction(&self) -> Correction {
        match self {
            Self::MissingReverseChannel { source, dest, .. } => Correction::AddChannel {
                source: *dest,
                dest: *source,
            },
            Self::MissingSelfChannel { process } => Correction::AddChannel {
                source: *process,
                dest: *process,
            },
            Self::DuplicateSelfChannel { extra, .. } => Correction::RemoveChannels(extra.clone()),
            Self::MissingInitiator { candidate } => Correction::SetInitiator {
                process: *candidate,
                initiator: true,
            },
            Self::MultipleInitiators { processes } => {
                Correction::KeepOnlyInitiator(processes.first().copied().unwrap_or_default())
            }
            Self::Algorithm { correction, .. } => correction.clone(),
        }
    }
}

impl fmt::Display for TopologyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingReverseChannel {
                channel,
                source,
                dest,
            } => write!(
                f,
                "undirected network: channel {channel} ({source}->{dest}) has no reverse"
            ),
            Self::MissingSelfChannel { process } => {
                write!(f, "process {process} has no self-channel")
            }
            Self::DuplicateSelfChannel { process, extra } => {
                write!(f, "process {process} has extra self-channels {extra:?}")
            }
            Self::MissingInitiator { .. } => f.write_str("no process is an initiator"),
            Self::MultipleInitiators { processes } => {
                write!(f, "centralized network has several initiators {processes:?}")
            }
            Self::Algorithm { message, .. } => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    directed: bool,
    centralized: bool,
    processes: Vec<ProcessSpec>,
    channels: Vec<ChannelSpec>,
}

impl Topology {
    #[must_use]
    pub const fn new(directed: bool, centralized: bool) -> Self {
        Self {
            directed,
            centralized,
            processes: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Builds a topology from a validated configuration file.
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        let mut topology = Self::new(config.directed, config.centralized);
        for (index, process) in config.processes.iter().enumerate() {
            topology.add_process(process.id)?;
            let spec = topology.process_mut(process.id)?;
            spec.name = process.display_name();
            spec.initiator = process.initiator;
            spec.receive_port = config.port_for_index(index);
        }
        for channel in &config.channels {
            topology.add_channel(channel.id, channel.source, channel.dest)?;
        }
        Ok(topology)
    }

    #[must_use]
    pub const fn directed(&self) -> bool {
        self.directed
    }

    #[must_use]
    pub const fn centralized(&self) -> bool {
        self.centralized
    }

    #[must_use]
    pub fn processes(&self) -> &[ProcessSpec] {
        &self.processes
    }

    #[must_use]
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    #[must_use]
    pub fn process(&self, id: ProcessId) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.id == id)
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Result<&mut ProcessSpec> {
        self.processes
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(SimError::unknown_process(id))
    }

    #[must_use]
    pub fn channel(&self, id: ChannelId) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn add_process(&mut self, id: ProcessId) -> Result<()> {
        if self.process(id).is_some() {
            return Err(SimError::topology(format!("duplicate process id {id}")));
        }
        self.processes.push(ProcessSpec {
            id,
            name: format!("p{id}"),
            initiator: false,
            receive_port: 0,
        });
        Ok(())
    }

    pub fn set_initiator(&mut self, id: ProcessId, initiator: bool) -> Result<()> {
        self.process_mut(id)?.initiator = initiator;
        Ok(())
    }

    pub fn add_channel(&mut self, id: ChannelId, source: ProcessId, dest: ProcessId) -> Result<()> {
        if self.channel(id).is_some() {
            return Err(SimError::topology(format!("duplicate channel id {id}")));
        }
        for endpoint in [source, dest] {
            if self.process(endpoint).is_none() {
                return Err(SimError::unknown_process(endpoint));
            }
        }
        self.channels.push(ChannelSpec { id, source, dest });
        Ok(())
    }

    /// Adds a channel with the next free id and returns that id.
    pub fn connect(&mut self, source: ProcessId, dest: ProcessId) -> Result<ChannelId> {
        let id = self.channels.iter().map(|c| c.id + 1).max().unwrap_or(0);
        self.add_channel(id, source, dest)?;
        Ok(id)
    }

    pub fn remove_channel(&mut self, id: ChannelId) -> Result<()> {
        let before = self.channels.len();
        self.channels.retain(|c| c.id != id);
        if self.channels.len() == before {
            return Err(SimError::unknown_channel(id));
        }
        Ok(())
    }

    /// Channels leaving `process`, including its self-channel.
    pub fn outgoing(&self, process: ProcessId) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |c| c.source == process)
    }

    /// Channels arriving at `process`, including its self-channel.
    pub fn incoming(&self, process: ProcessId) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |c| c.dest == process)
    }

    #[must_use]
    pub fn initiators(&self) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|p| p.initiator)
            .map(|p| p.id)
            .collect()
    }

    /// Runs the structural checks.
    #[must_use]
    pub fn check(&self) -> Vec<TopologyIssue> {
        let mut issues = Vec::new();

        if !self.directed {
            let mut pending = BTreeSet::new();
            for c in self.channels.iter().filter(|c| !c.is_self()) {
                let has_reverse = self
                    .channels
                    .iter()
                    .any(|r| r.source == c.dest && r.dest == c.source);
                // One issue per unordered pair
                if !has_reverse && pending.insert((c.source, c.dest)) {
                    issues.push(TopologyIssue::MissingReverseChannel {
                        channel: c.id,
                        source: c.source,
                        dest: c.dest,
                    });
                }
            }
        }

        for p in &self.processes {
            let self_channels: Vec<ChannelId> = self
                .channels
                .iter()
                .filter(|c| c.is_self() && c.source == p.id)
                .map(|c| c.id)
                .collect();
            match self_channels.as_slice() {
                [] => issues.push(TopologyIssue::MissingSelfChannel { process: p.id }),
                [_] => {}
                [_, extra @ ..] => issues.push(TopologyIssue::DuplicateSelfChannel {
                    process: p.id,
                    extra: extra.to_vec(),
                }),
            }
        }

        let initiators = self.initiators();
        if initiators.is_empty() {
            if let Some(first) = self.processes.first() {
                issues.push(TopologyIssue::MissingInitiator {
                    candidate: first.id,
                });
            }
        } else if self.centralized && initiators.len() > 1 {
            issues.push(TopologyIssue::MultipleInitiators {
                processes: initiators,
            });
        }

        issues
    }

    pub fn apply(&mut self, correction: &Correction) -> Result<()> {
        match correction {
            Correction::AddChannel { source, dest } => {
                self.connect(*source, *dest)?;
            }
            Correction::RemoveChannels(ids) => {
                for id in ids {
                    self.remove_channel(*id)?;
                }
            }
            Correction::SetInitiator { process, initiator } => {
                self.set_initiator(*process, *initiator)?;
            }
            Correction::KeepOnlyInitiator(keep) => {
                self.process_mut(*keep)?;
                for p in &mut self.processes {
                    p.initiator = p.id == *keep;
                }
            }
        }
        Ok(())
    }

    /// Applies the correction of every issue until the check comes back clean.
    ///
    /// Returns the corrections that were applied, in order.
    pub fn repair(&mut self) -> Result<Vec<Correction>> {
        let mut applied = Vec::new();
        loop {
            let issues = self.check();
            if issues.is_empty() {
                return Ok(applied);
            }
            // Corrections never create new issues, so one extra pass is enough
            if applied.len() > 2 * (self.channels.len() + self.processes.len()) + 4 {
                return Err(SimError::topology("repair did not converge"));
            }
            for issue in issues {
                let correction = issue.correction();
                info!("Applying correction: {correction} ({issue})");
                self.apply(&correction)?;
                applied.push(correction);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: u32, directed: bool) -> Topology {
        let mut t = Topology::new(directed, true);
        for id in 0..n {
            t.add_process(id).unwrap();
        }
        for id in 1..n {
            t.connect(id - 1, id).unwrap();
        }
        t
    }

    fn reverse_invariant_holds(t: &Topology) -> bool {
        t.channels().iter().filter(|c| !c.is_self()).all(|c| {
            t.channels()
                .iter()
                .any(|r| r.source == c.dest && r.dest == c.source)
        })
    }

    #[test]
    fn test_undirected_network_flags_missing_reverse() {
        let t = line(3, false);
        let missing: Vec<_> = t
            .check()
            .into_iter()
            .filter(|i| matches!(i, TopologyIssue::MissingReverseChannel { .. }))
            .collect();
        assert_eq!(missing.len(), 2);
        assert_eq!(
            missing[0].correction(),
            Correction::AddChannel { source: 1, dest: 0 }
        );
    }

    #[test]
    fn test_directed_network_does_not_need_reverse() {
        let t = line(3, true);
        assert!(!t
            .check()
            .iter()
            .any(|i| matches!(i, TopologyIssue::MissingReverseChannel { .. })));
    }

    #[test]
    fn test_repair_restores_invariants() {
        let mut t = line(4, false);
        let applied = t.repair().unwrap();
        assert!(!applied.is_empty());
        assert!(t.check().is_empty());
        assert!(reverse_invariant_holds(&t));

        // Exactly one self-channel per process
        for p in t.processes() {
            let selfs = t
                .channels()
                .iter()
                .filter(|c| c.is_self() && c.source == p.id)
                .count();
            assert_eq!(selfs, 1);
        }
        assert_eq!(t.initiators(), vec![0]);
    }

    #[test]
    fn test_duplicate_self_channels_are_removed() {
        let mut t = line(1, false);
        t.set_initiator(0, true).unwrap();
        let a = t.connect(0, 0).unwrap();
        let b = t.connect(0, 0).unwrap();
        assert_eq!(
            t.check(),
            vec![TopologyIssue::DuplicateSelfChannel {
                process: 0,
                extra: vec![b],
            }]
        );
        t.repair().unwrap();
        assert_eq!(t.channels().len(), 1);
        assert_eq!(t.channels()[0].id, a);
    }

    #[test]
    fn test_centralized_initiator_rules() {
        let mut t = line(3, true);
        t.set_initiator(1, true).unwrap();
        t.set_initiator(2, true).unwrap();
        assert!(t
            .check()
            .contains(&TopologyIssue::MultipleInitiators {
                processes: vec![1, 2]
            }));
        t.repair().unwrap();
        assert_eq!(t.initiators(), vec![1]);

        // Decentralized networks accept several initiators
        let mut d = Topology::new(true, false);
        for id in 0..2 {
            d.add_process(id).unwrap();
            d.set_initiator(id, true).unwrap();
            d.connect(id, id).unwrap();
        }
        assert!(d.check().is_empty());
    }

    #[test]
    fn test_construction_errors() {
        let mut t = line(2, true);
        assert!(t.add_process(0).is_err());
        assert!(t.add_channel(0, 0, 1).is_err());
        assert!(t.add_channel(9, 0, 7).is_err());
        assert!(t.remove_channel(42).is_err());
    }
}
