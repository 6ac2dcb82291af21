//! Directed channels between processes.
//!
//! A channel is shared between its source process (which sends on it), its
//! destination process (which tracks its termination flag) and the transport
//! (which owns the socket behind it). Operational fields are atomics. The
//! owning process is effectively the only writer.

use std::sync::{
    atomic::{AtomicBool, AtomicU16, Ordering},
    Mutex, PoisonError,
};

use dsim_common::{ChannelId, Message, ProcessId, Route};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    breakpoint::{Breakpoint, BreakpointTarget, ChannelInfo},
    error::{Result, SimError},
    termination::ChannelStatus,
};

/// Sending half of a channel's transport writer.
pub type Link = UnboundedSender<Message>;

#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    source: ProcessId,
    dest: ProcessId,
    source_port: AtomicU16,
    dest_port: AtomicU16,
    terminated: AtomicBool,
    link: Mutex<Option<Link>>,
    breakpoint: Breakpoint,
}

impl Channel {
    #[must_use]
    pub fn new(id: ChannelId, source: ProcessId, dest: ProcessId) -> Self {
        Self {
            id,
            source,
            dest,
            source_port: AtomicU16::new(0),
            dest_port: AtomicU16::new(0),
            terminated: AtomicBool::new(false),
            link: Mutex::new(None),
            breakpoint: Breakpoint::new(BreakpointTarget::Channel(id)),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub const fn source(&self) -> ProcessId {
        self.source
    }

    #[must_use]
    pub const fn dest(&self) -> ProcessId {
        self.dest
    }

    /// A self-channel only carries the self-addressed Terminate.
    #[must_use]
    pub const fn is_self(&self) -> bool {
        self.source == self.dest
    }

    #[must_use]
    pub fn source_port(&self) -> u16 {
        self.source_port.load(Ordering::Acquire)
    }

    pub fn set_source_port(&self, port: u16) {
        self.source_port.store(port, Ordering::Release);
    }

    #[must_use]
    pub fn dest_port(&self) -> u16 {
        self.dest_port.load(Ordering::Acquire)
    }

    pub fn set_dest_port(&self, port: u16) {
        self.dest_port.store(port, Ordering::Release);
    }

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        if self.terminated.load(Ordering::Acquire) {
            ChannelStatus::Terminated
        } else {
            ChannelStatus::NotTerminated
        }
    }

    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.status() == ChannelStatus::Terminated
    }

    #[must_use]
    pub const fn breakpoint(&self) -> &Breakpoint {
        &self.breakpoint
    }

    /// Header routing fields for a message sent on this channel.
    #[must_use]
    pub fn route(&self) -> Route {
        Route {
            source_process: self.source,
            source_port: self.source_port(),
            dest_process: self.dest,
            dest_port: self.dest_port(),
        }
    }

    #[must_use]
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id,
            source: self.source,
            dest: self.dest,
            termination_status: self.status(),
        }
    }

    /// Connects the channel to its transport writer.
    pub fn attach(&self, link: Link) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// Drops the writer handle; the transport closes the connection once the
    /// messages already handed over are flushed.
    pub fn close(&self) {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    /// Hands a message to the transport without waiting for delivery.
    pub fn transmit(&self, message: Message) -> Result<()> {
        let guard = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = guard.as_ref() else {
            return Err(SimError::network_msg(format!(
                "channel {} ({}->{}) is not connected",
                self.id, self.source, self.dest
            )));
        };
        link.send(message).map_err(|_| {
            SimError::network_msg(format!(
                "writer for channel {} ({}->{}) has stopped",
                self.id, self.source, self.dest
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use dsim_common::MessageType;
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn test_transmit_requires_link() {
        let channel = Channel::new(3, 0, 1);
        assert!(channel
            .transmit(Message::new(MessageType::Forwarded))
            .is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        assert!(channel.is_attached());
        channel
            .transmit(Message::new(MessageType::Forwarded))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().message_type, MessageType::Forwarded);

        channel.close();
        assert!(!channel.is_attached());
        assert!(channel.transmit(Message::new(MessageType::Backward)).is_err());
    }

    #[test]
    fn test_route_uses_current_ports() {
        let channel = Channel::new(0, 2, 5);
        channel.set_source_port(41000);
        channel.set_dest_port(41001);
        assert_eq!(
            channel.route(),
            Route {
                source_process: 2,
                source_port: 41000,
                dest_process: 5,
                dest_port: 41001,
            }
        );
        assert!(!channel.is_self());
        assert!(Channel::new(1, 4, 4).is_self());
    }

    #[test]
    fn test_termination_flag() {
        let channel = Channel::new(0, 0, 1);
        assert_eq!(channel.status(), ChannelStatus::NotTerminated);
        channel.mark_terminated();
        assert!(channel.is_terminated());
        assert_eq!(channel.info().termination_status, ChannelStatus::Terminated);
    }
}
