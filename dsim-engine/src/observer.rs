//! Notifications produced for the presentation layer.

use std::fmt;

use dsim_common::{ChannelId, FieldValue, ProcessId};
use log::{debug, error, info};

use crate::{breakpoint::BreakpointHit, error::SimError};

/// Network element whose presentation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    Network,
    Process(ProcessId),
    Channel(ChannelId),
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::Process(id) => write!(f, "process {id}"),
            Self::Channel(id) => write!(f, "channel {id}"),
        }
    }
}

/// Receiver of simulation state transitions.
///
/// Callbacks run on engine threads (process threads and the monitor) and must
/// not block for long.
pub trait Observer: Send + Sync {
    fn run_started(&self) {}

    fn run_finished(&self) {}

    /// The process is held until the controller releases it.
    fn process_awaiting_breakpoint(&self, _process: ProcessId, _hits: &[BreakpointHit]) {}

    /// The process finished handling one message.
    fn step_finished(&self, _process: ProcessId) {}

    fn presentation_changed(&self, _element: Element, _key: &str, _value: &FieldValue) {}

    /// Algorithm code misused the protocol; the process keeps running.
    fn protocol_error(&self, _process: ProcessId, _error: &SimError) {}
}

/// Observer that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn run_started(&self) {
        info!("Simulation started");
    }

    fn run_finished(&self) {
        info!("Simulation finished");
    }

    fn process_awaiting_breakpoint(&self, process: ProcessId, hits: &[BreakpointHit]) {
        let names: Vec<String> = hits
            .iter()
            .map(|h| format!("{} ({})", h.target, h.label))
            .collect();
        info!("p{process}: held on {}", names.join(", "));
    }

    fn step_finished(&self, process: ProcessId) {
        debug!("p{process}: step finished");
    }

    fn presentation_changed(&self, element: Element, key: &str, value: &FieldValue) {
        debug!("{element}: {key} = {value}");
    }

    fn protocol_error(&self, process: ProcessId, error: &SimError) {
        error!("p{process}: {error}");
    }
}
