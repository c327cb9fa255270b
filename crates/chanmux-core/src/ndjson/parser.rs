//! NDJSON line codec for the application boundary.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::types::{Command, Notification};
use crate::error::{Error, Result};

const COMMAND_TYPES: &[&str] = &[
    "join",
    "push",
    "subscribe",
    "on",
    "unsubscribe",
    "off",
    "leave",
];

/// Parse a single command line.
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let Some(raw) = parse_raw(line)? else {
        return Ok(None);
    };
    let msg_type = type_of(&raw)?;
    if !COMMAND_TYPES.contains(&msg_type) {
        return Err(Error::NdjsonParse(format!(
            "Unknown command type: {msg_type}"
        )));
    }
    decode(raw).map(Some)
}

/// Parse a single notification line.
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_notification(line: &str) -> Result<Option<Notification>> {
    let Some(raw) = parse_raw(line)? else {
        return Ok(None);
    };
    type_of(&raw)?;
    decode(raw).map(Some)
}

/// Encode a message as one line, without the trailing newline.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

fn parse_raw(line: &str) -> Result<Option<Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

fn type_of(raw: &Value) -> Result<&str> {
    raw.get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))
}

fn decode<T: DeserializeOwned>(raw: Value) -> Result<T> {
    serde_json::from_value(raw).map_err(|e| Error::NdjsonParse(e.to_string()))
}
