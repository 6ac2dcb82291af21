use std::{collections::BTreeMap, fmt};

use crate::{value::FieldValue, ChannelId, ProcessId};

/// Enum representing the type of a simulated message.
///
/// The first six variants are engine-defined. Algorithms add their own types
/// through [`MessageType::Algorithm`], which is keyed by name on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    NullMessageType,
    /// Sentinel meaning "nothing to process".
    EmptyMessage,
    /// Engine-internal termination signal.
    Terminate,
    Forwarded,
    Backward,
    LastMessage,
    /// Algorithm-defined type.
    Algorithm(String),
}

impl MessageType {
    const ENGINE_TYPES: [Self; 6] = [
        Self::NullMessageType,
        Self::EmptyMessage,
        Self::Terminate,
        Self::Forwarded,
        Self::Backward,
        Self::LastMessage,
    ];

    /// Name used as the top-level tag of the wire document.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::NullMessageType => "NullMessageType",
            Self::EmptyMessage => "EmptyMessage",
            Self::Terminate => "Terminate",
            Self::Forwarded => "Forwarded",
            Self::Backward => "Backward",
            Self::LastMessage => "LastMessage",
            Self::Algorithm(name) => name,
        }
    }

    /// Resolves a tag name back to a type.
    ///
    /// Names that do not match an engine type are algorithm-defined.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ENGINE_TYPES
            .into_iter()
            .find(|t| t.name() == name)
            .unwrap_or_else(|| Self::Algorithm(name.to_owned()))
    }

    #[must_use]
    pub const fn is_engine_defined(&self) -> bool {
        !matches!(self, Self::Algorithm(_))
    }

    /// True for an algorithm type whose name collides with an engine type.
    /// Such a type cannot survive the wire: it would decode as the engine type.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        match self {
            Self::Algorithm(name) => Self::ENGINE_TYPES.iter().any(|t| t.name() == name),
            _ => false,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Endpoints of a channel, used to stamp a message header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub source_process: ProcessId,
    pub source_port: u16,
    pub dest_process: ProcessId,
    pub dest_port: u16,
}

/// Fixed message header.
///
/// Every field starts unset. A field that was never set reads as `None`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    pub source_process: Option<ProcessId>,
    pub source_port: Option<u16>,
    pub dest_process: Option<ProcessId>,
    pub dest_port: Option<u16>,
    pub round: Option<i64>,
    pub logical_clock: Option<i64>,
}

impl Header {
    /// True when no header field has been set.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.source_process.is_none()
            && self.source_port.is_none()
            && self.dest_process.is_none()
            && self.dest_port.is_none()
            && self.round.is_none()
            && self.logical_clock.is_none()
    }

    /// Overwrites the four routing fields from a channel route.
    pub fn apply_route(&mut self, route: Route) {
        self.source_process = Some(route.source_process);
        self.source_port = Some(route.source_port);
        self.dest_process = Some(route.dest_process);
        self.dest_port = Some(route.dest_port);
    }
}

/// A header-plus-fields unit of communication between processes.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub header: Header,
    /// Display name of the message.
    pub name: String,
    /// Index in the receiving queue at enqueue time (diagnostic, not encoded).
    pub position_in_queue: Option<usize>,
    /// Inbound channel the message was delivered on (not encoded).
    pub arrived_on: Option<ChannelId>,
    /// Algorithm-specific fields.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Message {
    /// Constructs a message of the given type with an unset header.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        let name = message_type.name().to_owned();
        Self {
            message_type,
            header: Header::default(),
            name,
            position_in_queue: None,
            arrived_on: None,
            fields: BTreeMap::new(),
        }
    }

    /// The "nothing to process" sentinel.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(MessageType::EmptyMessage)
    }

    /// Constructs a message whose routing header is copied from a channel.
    #[must_use]
    pub fn on_route(message_type: MessageType, route: Route) -> Self {
        let mut msg = Self::new(message_type);
        msg.header.apply_route(route);
        msg
    }

    /// Constructs a derivative of `source`: the header is copied verbatim.
    #[must_use]
    pub fn derived_from(source: &Self, message_type: MessageType) -> Self {
        let mut msg = Self::new(message_type);
        msg.header = source.header;
        msg
    }

    #[must_use]
    pub fn with_round(mut self, round: i64) -> Self {
        self.header.round = Some(round);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// True for the empty sentinel: type `EmptyMessage` and no header field set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message_type == MessageType::EmptyMessage && self.header.is_unset()
    }

    #[must_use]
    pub fn is_terminate(&self) -> bool {
        self.message_type == MessageType::Terminate
    }

    /// Looks up an algorithm field; `None` means no such field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn remove_field(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    #[must_use]
    pub const fn source_process(&self) -> Option<ProcessId> {
        self.header.source_process
    }

    #[must_use]
    pub const fn dest_process(&self) -> Option<ProcessId> {
        self.header.dest_process
    }

    #[must_use]
    pub const fn round(&self) -> Option<i64> {
        self.header.round
    }

    #[must_use]
    pub const fn logical_clock(&self) -> Option<i64> {
        self.header.logical_clock
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type)?;
        if let (Some(src), Some(dst)) = (self.header.source_process, self.header.dest_process) {
            write!(f, " {src}->{dst}")?;
        }
        if let Some(round) = self.header.round {
            write!(f, " r{round}")?;
        }
        if !self.fields.is_empty() {
            write!(f, " {{")?;
            for (i, (k, v)) in self.fields.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE: Route = Route {
        source_process: 0,
        source_port: 5000,
        dest_process: 1,
        dest_port: 5001,
    };

    #[test]
    fn test_empty_sentinel_is_not_terminate() {
        let empty = Message::empty();
        assert!(empty.is_empty());
        assert!(!empty.is_terminate());

        let terminate = Message::new(MessageType::Terminate);
        assert!(!terminate.is_empty());
        assert!(terminate.is_terminate());

        // An EmptyMessage that carries a header is a real message
        let routed = Message::on_route(MessageType::EmptyMessage, ROUTE);
        assert!(!routed.is_empty());
    }

    #[test]
    fn test_derived_copies_header_verbatim() {
        let source = Message::on_route(MessageType::Forwarded, ROUTE)
            .with_round(3)
            .with_field("hops", 2i64);
        let derived = Message::derived_from(&source, MessageType::Backward);

        assert_eq!(derived.header, source.header);
        assert_eq!(derived.message_type, MessageType::Backward);
        assert!(derived.fields.is_empty());
    }

    #[test]
    fn test_missing_lookups_return_none() {
        let msg = Message::new(MessageType::Forwarded);
        assert_eq!(msg.field("nope"), None);
        assert_eq!(msg.round(), None);
        assert_eq!(msg.source_process(), None);
        assert_eq!(msg.logical_clock(), None);
    }

    #[test]
    fn test_type_names_resolve() {
        for t in MessageType::ENGINE_TYPES {
            assert_eq!(MessageType::from_name(t.name()), t);
        }
        let custom = MessageType::from_name("Probe");
        assert_eq!(custom, MessageType::Algorithm("Probe".to_owned()));
        assert!(!custom.is_engine_defined());
        assert!(!custom.is_reserved());
    }

    #[test]
    fn test_algorithm_types_named_after_engine_types_are_reserved() {
        assert!(MessageType::Algorithm("Terminate".into()).is_reserved());
        assert!(MessageType::Algorithm("Forwarded".into()).is_reserved());
        assert!(!MessageType::Terminate.is_reserved());
        assert!(!MessageType::Algorithm("terminate".into()).is_reserved());
    }
}
