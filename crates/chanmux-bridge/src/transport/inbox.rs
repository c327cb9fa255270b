//! Session inbox handles given to transports.
//!
//! Transports may call these from any task or thread. They only enqueue;
//! the session's dispatch loop is the sole consumer.

use chanmux_core::PushId;
use serde_json::Value;
use tokio::sync::mpsc;

use super::Reply;

/// Input queued for the session by a transport.
#[derive(Debug)]
pub enum TransportInput {
    JoinReply {
        name: String,
        attempt: u64,
        reply: Reply,
    },
    PushReply {
        id: PushId,
        reply: Reply,
    },
    Event {
        channel: String,
        event: String,
        subscription: u64,
        payload: Value,
    },
    /// The server terminated a joined channel.
    ChannelClosed {
        name: String,
        attempt: u64,
        reason: String,
    },
    Disconnected {
        reason: String,
    },
}

/// Create a session inbox.
pub fn inbox() -> (TransportSink, mpsc::UnboundedReceiver<TransportInput>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransportSink { tx }, rx)
}

/// Connection-level sink and factory for per-operation handles.
#[derive(Debug, Clone)]
pub struct TransportSink {
    tx: mpsc::UnboundedSender<TransportInput>,
}

impl TransportSink {
    /// Report that the connection is gone.
    pub fn disconnected(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportInput::Disconnected {
            reason: reason.into(),
        });
    }

    /// Whether the session stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn join_slot(&self, name: &str, attempt: u64) -> ReplySlot {
        ReplySlot {
            tx: self.tx.clone(),
            target: ReplyTarget::Join {
                name: name.to_string(),
                attempt,
            },
        }
    }

    pub(crate) fn channel_sink(&self, name: &str, attempt: u64) -> ChannelSink {
        ChannelSink {
            tx: self.tx.clone(),
            name: name.to_string(),
            attempt,
        }
    }

    pub(crate) fn push_slot(&self, id: PushId) -> ReplySlot {
        ReplySlot {
            tx: self.tx.clone(),
            target: ReplyTarget::Push { id },
        }
    }

    pub(crate) fn event_sink(&self, channel: &str, event: &str, subscription: u64) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            channel: channel.to_string(),
            event: event.to_string(),
            subscription,
        }
    }
}

#[derive(Debug)]
enum ReplyTarget {
    Join { name: String, attempt: u64 },
    Push { id: PushId },
}

/// One-shot reply handle for a join or push.
///
/// Completing consumes the slot, so a reply is delivered at most once.
#[derive(Debug)]
#[must_use = "a reply slot must be completed or the caller never hears back"]
pub struct ReplySlot {
    tx: mpsc::UnboundedSender<TransportInput>,
    target: ReplyTarget,
}

impl ReplySlot {
    pub fn complete(self, reply: Reply) {
        let input = match self.target {
            ReplyTarget::Join { name, attempt } => TransportInput::JoinReply {
                name,
                attempt,
                reply,
            },
            ReplyTarget::Push { id } => TransportInput::PushReply { id, reply },
        };
        let _ = self.tx.send(input);
    }
}

/// Lifecycle handle for one join attempt.
///
/// Lets a transport report that the server ended a channel after it was
/// joined.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportInput>,
    name: String,
    attempt: u64,
}

impl ChannelSink {
    pub fn closed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(TransportInput::ChannelClosed {
            name: self.name.clone(),
            attempt: self.attempt,
            reason: reason.into(),
        });
    }
}

/// Delivery handle for one event listener.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportInput>,
    channel: String,
    event: String,
    subscription: u64,
}

impl EventSink {
    pub fn deliver(&self, payload: Value) {
        let _ = self.tx.send(TransportInput::Event {
            channel: self.channel.clone(),
            event: self.event.clone(),
            subscription: self.subscription,
            payload,
        });
    }

    /// Event name this sink listens for.
    pub fn event(&self) -> &str {
        &self.event
    }
}
