//! Channel registry: the single source of truth for "is this channel joined".

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use super::types::ChannelState;
use crate::transport::{ChannelRef, Reply, Transport, TransportError, TransportSink};

/// Registry entry for one channel name.
#[derive(Debug)]
pub struct ChannelEntry {
    pub name: String,
    pub handle: ChannelRef,
    pub state: ChannelState,
    /// Params the join was issued with.
    pub params: Value,
    /// Payload of the terminal join reply, once it arrived.
    pub last_reply: Option<Value>,
    pub(crate) attempt: u64,
}

/// Result of [`ChannelRegistry::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A transport join was issued.
    Joining(ChannelRef),
    /// A failed entry was replaced by a fresh join; `previous` is dead.
    Rejoining {
        handle: ChannelRef,
        previous: ChannelRef,
    },
    /// The channel is already joining or joined; nothing was issued.
    Existing {
        handle: ChannelRef,
        state: ChannelState,
    },
}

/// Channel name to entry map, owned by the session.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, ChannelEntry>,
    next_attempt: u64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, joining it on the transport unless it is already
    /// joining or joined. A `JoinFailed` entry is replaced by a fresh join.
    pub fn open<T: Transport + ?Sized>(
        &mut self,
        name: &str,
        params: Value,
        transport: &mut T,
        sink: &TransportSink,
    ) -> Result<OpenOutcome, TransportError> {
        if let Some(entry) = self.channels.get(name)
            && matches!(entry.state, ChannelState::Joining | ChannelState::Joined)
        {
            debug!(channel = name, state = ?entry.state, "Channel already open");
            return Ok(OpenOutcome::Existing {
                handle: entry.handle,
                state: entry.state,
            });
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let handle = transport.join(
            name,
            params.clone(),
            sink.join_slot(name, attempt),
            sink.channel_sink(name, attempt),
        )?;
        let previous = self.channels.insert(
            name.to_string(),
            ChannelEntry {
                name: name.to_string(),
                handle,
                state: ChannelState::Joining,
                params,
                last_reply: None,
                attempt,
            },
        );

        info!(
            channel = name,
            attempt,
            retry = previous.is_some(),
            "Joining channel"
        );
        Ok(match previous {
            Some(previous) => OpenOutcome::Rejoining {
                handle,
                previous: previous.handle,
            },
            None => OpenOutcome::Joining(handle),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&ChannelEntry> {
        self.channels.get(name)
    }

    /// Apply a terminal join reply.
    ///
    /// Returns the new state, or `None` when the reply belongs to an attempt
    /// that is no longer current (the entry was left or re-opened).
    pub(crate) fn resolve(&mut self, name: &str, attempt: u64, reply: &Reply) -> Option<ChannelState> {
        let entry = self.channels.get_mut(name)?;
        if entry.attempt != attempt || entry.state != ChannelState::Joining {
            return None;
        }
        entry.state = if reply.is_ok() {
            ChannelState::Joined
        } else {
            ChannelState::JoinFailed
        };
        entry.last_reply = Some(reply.payload.clone());
        Some(entry.state)
    }

    /// Detach a joined entry the server terminated.
    ///
    /// Returns `None` when the notice belongs to an attempt that is no longer
    /// current or never joined.
    pub(crate) fn close(&mut self, name: &str, attempt: u64) -> Option<ChannelEntry> {
        let entry = self.channels.get(name)?;
        if entry.attempt != attempt || entry.state != ChannelState::Joined {
            return None;
        }
        self.remove(name)
    }

    /// Detach an entry, returning it in state `Left`. Never talks to the
    /// transport.
    pub fn remove(&mut self, name: &str) -> Option<ChannelEntry> {
        let mut entry = self.channels.remove(name)?;
        entry.state = ChannelState::Left;
        Some(entry)
    }

    /// Detach every entry, for session teardown.
    pub fn drain(&mut self) -> Vec<ChannelEntry> {
        self.channels.drain().map(|(_, entry)| entry).collect()
    }

    /// Names of entries in `state`, sorted.
    pub fn names_in(&self, state: ChannelState) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn count_in(&self, state: ChannelState) -> usize {
        self.channels.values().filter(|e| e.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::transport::{TransportInput, inbox};

    #[test]
    fn open_twice_issues_one_join() {
        let mut transport = ScriptedTransport::connected();
        let (sink, _rx) = inbox();
        let mut registry = ChannelRegistry::new();

        let first = registry
            .open("lobby", json!({}), &mut transport, &sink)
            .unwrap();
        let second = registry
            .open("lobby", json!({"ignored": true}), &mut transport, &sink)
            .unwrap();

        let OpenOutcome::Joining(handle) = first else {
            unreachable!("first open must join");
        };
        assert_eq!(
            second,
            OpenOutcome::Existing {
                handle,
                state: ChannelState::Joining,
            }
        );
        assert_eq!(transport.join_count("lobby"), 1);
        assert_eq!(registry.lookup("lobby").unwrap().params, json!({}));
    }

    #[test]
    fn join_failed_entry_is_retained_and_retried_explicitly() {
        let mut transport = ScriptedTransport::connected();
        let (sink, mut rx) = inbox();
        let mut registry = ChannelRegistry::new();

        registry
            .open("room:1", json!({}), &mut transport, &sink)
            .unwrap();
        assert!(transport.reply_join("room:1", Reply::reason("denied")));
        let TransportInput::JoinReply { attempt, reply, .. } = rx.try_recv().unwrap() else {
            unreachable!("expected a join reply");
        };
        assert_eq!(
            registry.resolve("room:1", attempt, &reply),
            Some(ChannelState::JoinFailed)
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names_in(ChannelState::JoinFailed), vec!["room:1"]);

        let first = registry.lookup("room:1").unwrap().handle;
        let outcome = registry
            .open("room:1", json!({}), &mut transport, &sink)
            .unwrap();
        let OpenOutcome::Rejoining { handle, previous } = outcome else {
            unreachable!("retry must rejoin, got {outcome:?}");
        };
        assert_eq!(previous, first);
        assert_ne!(handle, first);
        assert_eq!(transport.join_count("room:1"), 2);

        // The first attempt's reply no longer applies.
        assert_eq!(registry.resolve("room:1", attempt, &Reply::ok(json!({}))), None);
        assert_eq!(
            registry.lookup("room:1").unwrap().state,
            ChannelState::Joining
        );
    }

    #[test]
    fn close_applies_only_to_current_joined_attempt() {
        let mut transport = ScriptedTransport::connected();
        let (sink, mut rx) = inbox();
        let mut registry = ChannelRegistry::new();
        registry
            .open("lobby", json!({}), &mut transport, &sink)
            .unwrap();
        let attempt = registry.lookup("lobby").unwrap().attempt;

        // Still joining: nothing to close.
        assert!(registry.close("lobby", attempt).is_none());

        transport.reply_join("lobby", Reply::ok(json!({})));
        let TransportInput::JoinReply { reply, .. } = rx.try_recv().unwrap() else {
            unreachable!("expected a join reply");
        };
        registry.resolve("lobby", attempt, &reply);

        assert!(registry.close("lobby", attempt + 1).is_none());
        let entry = registry.close("lobby", attempt).unwrap();
        assert_eq!(entry.state, ChannelState::Left);
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_transport_join_leaves_no_entry() {
        let mut transport = ScriptedTransport::new();
        let (sink, _rx) = inbox();
        let mut registry = ChannelRegistry::new();

        let err = registry
            .open("lobby", json!({}), &mut transport, &sink)
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_does_not_touch_transport() {
        let mut transport = ScriptedTransport::connected_with_leave();
        let (sink, _rx) = inbox();
        let mut registry = ChannelRegistry::new();
        registry
            .open("lobby", json!({}), &mut transport, &sink)
            .unwrap();

        let entry = registry.remove("lobby").unwrap();
        assert_eq!(entry.name, "lobby");
        assert_eq!(entry.state, ChannelState::Left);
        assert!(registry.lookup("lobby").is_none());
        assert!(transport.left_topics().is_empty());
    }
}
