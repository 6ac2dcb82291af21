use dsim_common::{wire::WireError, ChannelId, ProcessId};
use thiserror::Error;

/// Main error type for simulation engine operations
#[derive(Error, Debug)]
pub enum SimError {
    /// Transport-related errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Misuse of the messaging protocol by algorithm code
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        process: Option<ProcessId>,
    },

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] WireError),

    /// Topology errors found outside the check phase
    #[error("Topology error: {message}")]
    Topology { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Lookup of an element that is not part of the network
    #[error("Unknown {kind} {id}")]
    Unknown { kind: ElementKind, id: u32 },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// I/O errors (wrapper for `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors for unexpected conditions
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Kinds of network element that can be looked up by id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Process,
    Channel,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Channel => f.write_str("channel"),
        }
    }
}

impl SimError {
    pub fn network<E>(message: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }
    pub fn network_msg(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }
    pub fn protocol(message: impl Into<String>, process: Option<ProcessId>) -> Self {
        Self::Protocol {
            message: message.into(),
            process,
        }
    }
    pub fn topology(message: impl Into<String>) -> Self {
        Self::Topology {
            message: message.into(),
        }
    }
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
    #[must_use]
    pub const fn unknown_process(id: ProcessId) -> Self {
        Self::Unknown {
            kind: ElementKind::Process,
            id,
        }
    }
    #[must_use]
    pub const fn unknown_channel(id: ChannelId) -> Self {
        Self::Unknown {
            kind: ElementKind::Channel,
            id,
        }
    }
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T, E = SimError> = std::result::Result<T, E>;
