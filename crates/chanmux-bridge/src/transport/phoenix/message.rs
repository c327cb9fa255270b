//! Phoenix socket wire frames (serializer version 2.0.0).
//!
//! Every frame is a JSON array `[join_ref, ref, topic, event, payload]`.

use serde_json::{Value, json};

use crate::transport::{Reply, TransportError};

pub const VSN: &str = "2.0.0";
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";

/// One decoded socket frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

type RawFrame = (Option<String>, Option<String>, String, String, Value);

impl Frame {
    pub fn new(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(None, Some(msg_ref), PHOENIX_TOPIC, HEARTBEAT, json!({}))
    }

    pub fn encode(&self) -> String {
        json!([
            self.join_ref,
            self.msg_ref,
            self.topic,
            self.event,
            self.payload
        ])
        .to_string()
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let (join_ref, msg_ref, topic, event, payload): RawFrame = serde_json::from_str(text)
            .map_err(|e| TransportError::Protocol(format!("malformed frame: {e}")))?;
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }

    /// Interpret a `phx_reply` payload `{"status": …, "response": …}`.
    pub fn reply(&self) -> Reply {
        let response = self
            .payload
            .get("response")
            .cloned()
            .unwrap_or_else(|| json!({}));
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Reply::ok(response),
            _ => Reply::error(response),
        }
    }
}
