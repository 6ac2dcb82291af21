//! Common types for the dsim distributed algorithm simulator.
//!
//! This crate provides the definitions shared between the execution engine and
//! any external tooling: process/channel identifiers, the message model with its
//! open field map, and the self-describing wire encoding used on every channel.

pub mod constants;
pub mod message;
pub mod value;
pub mod wire;

pub use message::{Header, Message, MessageType, Route};
pub use value::FieldValue;

/// Identifier of a simulated process.
pub type ProcessId = u32;

/// Identifier of a directed channel.
pub type ChannelId = u32;
