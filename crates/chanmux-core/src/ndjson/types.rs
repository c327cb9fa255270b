//! Application command and notification types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-assigned correlation id linking a push to its reply.
///
/// Accepts either a JSON integer or a JSON string so applications can keep
/// whichever id scheme they already use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushId {
    Int(i64),
    Str(String),
}

impl fmt::Display for PushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PushId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for PushId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PushId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Command sent by the application to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Join (or re-use) the channel `name`.
    Join {
        name: String,
        #[serde(default = "empty_object")]
        params: Value,
    },
    /// Push `event` on a joined channel, correlated by `id`.
    ///
    /// An absent payload and an empty payload are distinct pushes.
    Push {
        channel: String,
        id: PushId,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Start delivering `event` from `channel`.
    #[serde(alias = "on")]
    Subscribe { channel: String, event: String },
    /// Stop delivering `event` from `channel`.
    #[serde(alias = "off")]
    Unsubscribe { channel: String, event: String },
    /// Leave `name` and drop its subscriptions.
    Leave { name: String },
}

impl Command {
    /// Short name of the command variant, used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Push { .. } => "push",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Leave { .. } => "leave",
        }
    }

    /// Channel the command targets.
    pub fn channel(&self) -> &str {
        match self {
            Self::Join { name, .. } | Self::Leave { name } => name,
            Self::Push { channel, .. }
            | Self::Subscribe { channel, .. }
            | Self::Unsubscribe { channel, .. } => channel,
        }
    }
}

/// Routing failures reported back to the application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteError {
    #[error("Channel not found: {channel}")]
    ChannelNotFound { channel: String },

    #[error("No subscription for event {event} on channel {channel}")]
    SubscriptionNotFound { channel: String, event: String },

    #[error("Push id already outstanding: {id}")]
    DuplicatePushId { id: PushId },

    #[error("Transport rejected operation on channel {channel}: {reason}")]
    Transport { channel: String, reason: String },
}

/// Notification delivered by the bridge to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    JoinOk {
        name: String,
        payload: Value,
    },
    JoinError {
        name: String,
        payload: Value,
    },
    PushOk {
        id: PushId,
        payload: Value,
    },
    PushError {
        id: PushId,
        payload: Value,
    },
    EventReceived {
        channel: String,
        event: String,
        payload: Value,
    },
    Left {
        name: String,
    },
    /// The server ended a joined channel. It is no longer open; a new
    /// `join` starts over.
    ChannelClosed {
        name: String,
        reason: String,
    },
    /// A command could not be routed; `command` is echoed back verbatim.
    CommandRejected {
        command: Command,
        error: RouteError,
    },
    /// The transport went away. Nothing further will be delivered.
    SessionClosed {
        reason: String,
        #[serde(default)]
        abandoned_pushes: Vec<PushId>,
        #[serde(default)]
        unresolved_joins: Vec<String>,
    },
}

impl Notification {
    /// Short name of the notification variant, used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinOk { .. } => "join_ok",
            Self::JoinError { .. } => "join_error",
            Self::PushOk { .. } => "push_ok",
            Self::PushError { .. } => "push_error",
            Self::EventReceived { .. } => "event_received",
            Self::Left { .. } => "left",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::CommandRejected { .. } => "command_rejected",
            Self::SessionClosed { .. } => "session_closed",
        }
    }
}
