//! Topology configuration for dsim simulations.
//!
//! A [`TopologyConfig`] is the on-disk description of a network: which
//! algorithm to run, the processes, the directed channels between them and
//! the runtime knobs of the run.

pub mod config;

pub use config::{ChannelConfig, ProcessConfig, TopologyConfig};
