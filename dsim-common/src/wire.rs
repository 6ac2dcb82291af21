//! Wire encoding of messages.
//!
//! Every message is a self-describing JSON document with a single top-level
//! key naming the message type. The value holds the header fields, then the
//! message name, then the algorithm field map:
//!
//! ```json
//! {"Forwarded":{"source_process":0,"source_port":40112,"dest_process":1,
//!   "dest_port":40113,"round":2,"logical_clock":7,"name":"Forwarded",
//!   "fields":{"hops":2}}}
//! ```
//!
//! Decoding dispatches on the tag name through [`MessageType::from_name`].
//! Header fields that were never set are omitted and decode as unset.
//!
//! [`encode`] refuses messages that would not decode back to themselves: an
//! algorithm type named after an engine type, or a non-finite float field
//! (JSON has no literal for NaN or infinity).
//!
//! A connection starts with one [`Handshake`] document identifying the channel,
//! followed by newline-delimited message documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    message::{Header, Message, MessageType},
    value::FieldValue,
    ChannelId, ProcessId,
};

/// Errors produced while encoding or decoding wire documents.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must have exactly one top-level type tag, found {found}")]
    TypeTag { found: usize },

    #[error("algorithm message type '{name}' is reserved for the engine")]
    ReservedTag { name: String },

    #[error("field '{field}' holds a non-finite float")]
    NonFiniteFloat { field: String },
}

/// First frame written on every connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub channel: ChannelId,
    pub source: ProcessId,
}

#[derive(Serialize, Deserialize)]
struct Body {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_process: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_process: Option<ProcessId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    round: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logical_clock: Option<i64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
}

/// Checks that a message can be encoded and decoded without change.
pub fn validate(message: &Message) -> Result<(), WireError> {
    if message.message_type.is_reserved() {
        return Err(WireError::ReservedTag {
            name: message.message_type.name().to_owned(),
        });
    }
    for (field, value) in &message.fields {
        if !is_finite(value) {
            return Err(WireError::NonFiniteFloat {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

fn is_finite(value: &FieldValue) -> bool {
    match value {
        FieldValue::Float(v) => v.is_finite(),
        FieldValue::List(items) => items.iter().all(is_finite),
        _ => true,
    }
}

/// Serializes a message to its wire document (no trailing newline).
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    validate(message)?;
    let h = message.header;
    let body = Body {
        source_process: h.source_process,
        source_port: h.source_port,
        dest_process: h.dest_process,
        dest_port: h.dest_port,
        round: h.round,
        logical_clock: h.logical_clock,
        name: message.name.clone(),
        fields: message.fields.clone(),
    };
    // Serialized straight from the struct so the key order is kept
    let doc = BTreeMap::from([(message.message_type.name(), &body)]);
    Ok(serde_json::to_vec(&doc)?)
}

/// Reconstructs a message from its wire document.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)?;
    if doc.len() != 1 {
        return Err(WireError::TypeTag { found: doc.len() });
    }
    let Some((tag, value)) = doc.into_iter().next() else {
        return Err(WireError::TypeTag { found: 0 });
    };
    let body: Body = serde_json::from_value(value)?;

    let mut message = Message::new(MessageType::from_name(&tag));
    message.header = Header {
        source_process: body.source_process,
        source_port: body.source_port,
        dest_process: body.dest_process,
        dest_port: body.dest_port,
        round: body.round,
        logical_clock: body.logical_clock,
    };
    message.name = body.name;
    message.fields = body.fields;
    Ok(message)
}

pub fn encode_handshake(handshake: &Handshake) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(handshake)?)
}

pub fn decode_handshake(bytes: &[u8]) -> Result<Handshake, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}
