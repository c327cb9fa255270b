//! Transport adapter contract.
//!
//! A transport owns one physical connection and exposes channel-scoped
//! join/push/on/off/leave primitives. Every method returns immediately;
//! replies and events come back later through the [`ReplySlot`] and
//! [`EventSink`] handles the session passes in, which feed the session
//! inbox rather than touching session state directly.

mod inbox;
pub mod phoenix;

use serde_json::Value;

pub use inbox::{ChannelSink, EventSink, ReplySlot, TransportInput, TransportSink, inbox};
pub use phoenix::{PhoenixConfig, PhoenixTransport};

/// Transport-side handle of a joined or joining channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRef(pub u64);

/// Transport-side handle of one event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerRef(pub u64);

/// Terminal status of a join or push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// Terminal reply to a join or push.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub payload: Value,
}

impl Reply {
    pub const fn ok(payload: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            payload,
        }
    }

    pub const fn error(payload: Value) -> Self {
        Self {
            status: ReplyStatus::Error,
            payload,
        }
    }

    /// Error reply carrying `{"reason": reason}`.
    pub fn reason(reason: impl Into<String>) -> Self {
        Self::error(serde_json::json!({ "reason": reason.into() }))
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// Transport-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Operation not supported by transport: {0}")]
    Unsupported(&'static str),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Channel transport consumed by the session multiplexer.
///
/// When a method returns `Err`, the reply slot or event sink it was given
/// is dropped without being used. Slots still outstanding when the
/// connection drops are never completed; the disconnect reported through
/// the [`TransportSink`] supersedes them.
pub trait Transport: Send {
    /// Open the connection. Calling it again on a connected transport is a
    /// no-op. `sink` reports disconnection back to the session.
    fn connect(&mut self, sink: TransportSink) -> Result<(), TransportError>;

    /// Start joining `topic`. `reply` is completed exactly once. If the
    /// server later terminates the joined channel, report it on `lifecycle`.
    fn join(
        &mut self,
        topic: &str,
        params: Value,
        reply: ReplySlot,
        lifecycle: ChannelSink,
    ) -> Result<ChannelRef, TransportError>;

    /// Push `event` on a channel. `reply` is completed exactly once.
    fn push(
        &mut self,
        channel: ChannelRef,
        event: &str,
        payload: Option<Value>,
        reply: ReplySlot,
    ) -> Result<(), TransportError>;

    /// Register a listener for `event`; each occurrence goes to `sink`.
    fn on(
        &mut self,
        channel: ChannelRef,
        event: &str,
        sink: EventSink,
    ) -> Result<ListenerRef, TransportError>;

    /// Remove a listener registered with [`Transport::on`].
    fn off(
        &mut self,
        channel: ChannelRef,
        event: &str,
        listener: ListenerRef,
    ) -> Result<(), TransportError>;

    /// Whether [`Transport::leave`] is available.
    fn supports_leave(&self) -> bool {
        false
    }

    fn leave(&mut self, channel: ChannelRef) -> Result<(), TransportError> {
        let _ = channel;
        Err(TransportError::Unsupported("leave"))
    }
}
