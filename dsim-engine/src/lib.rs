//! Concurrent execution engine for simulated distributed algorithms.
//!
//! Every process runs its receive loop on its own OS thread. Channels are real
//! TCP connections on the local host, driven by a tokio runtime owned by the
//! network.

pub mod algorithm;
pub mod algorithms;
pub mod breakpoint;
pub mod channel;
pub mod clock;
pub mod error;
pub mod events;
pub mod network;
pub mod observer;
pub mod process;
pub mod queue;
pub mod runlog;
pub mod signal;
pub mod termination;
pub mod topology;
pub mod transport;

// Re-export key types for convenience
pub use algorithm::{Algorithm, AlgorithmFactory, AlgorithmRegistry, Params, ProcessContext};
pub use breakpoint::{Breakpoint, BreakpointHit, BreakpointTarget, EvaluationMode};
pub use error::{Result, SimError};
pub use events::{EventKey, EventTables, TargetSelection, TriggerPoint, TriggeredMessage};
pub use network::{Network, NetworkOptions};
pub use observer::{Element, LogObserver, Observer};
pub use queue::QueueDiscipline;
pub use termination::{ChannelStatus, TerminationStatus};
pub use topology::{Correction, Topology, TopologyIssue};
