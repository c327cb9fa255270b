//! In-memory transport for tests.
//!
//! [`ScriptedTransport`] records every call and lets the test decide when
//! and how joins and pushes are answered. Clones share state, so a test
//! keeps one clone while the session owns the other.
//!
//! Listeners are bound to a channel handle, not a topic: after a topic is
//! joined again, only listeners attached to the newest handle hear events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::transport::{
    ChannelRef, ChannelSink, EventSink, ListenerRef, Reply, ReplySlot, Transport, TransportError,
    TransportSink,
};

struct PendingJoin {
    topic: String,
    params: Value,
    slot: Option<ReplySlot>,
    lifecycle: ChannelSink,
}

struct PushRecord {
    topic: String,
    event: String,
    payload: Option<Value>,
    slot: Option<ReplySlot>,
}

struct Binding {
    listener: ListenerRef,
    channel: ChannelRef,
    topic: String,
    sink: EventSink,
}

#[derive(Default)]
struct Script {
    sink: Option<TransportSink>,
    supports_leave: bool,
    fail_pushes: bool,
    connect_count: usize,
    next_ref: u64,
    channels: HashMap<ChannelRef, String>,
    current: HashMap<String, ChannelRef>,
    joins: Vec<PendingJoin>,
    pushes: Vec<PushRecord>,
    bindings: Vec<Binding>,
    off_count: usize,
    left: Vec<String>,
}

impl Script {
    fn topic(&self, channel: ChannelRef) -> Result<String, TransportError> {
        self.channels
            .get(&channel)
            .cloned()
            .ok_or_else(|| TransportError::Protocol(format!("unknown channel {}", channel.0)))
    }

    fn live(&self, topic: &str, event: &str) -> impl Iterator<Item = &Binding> {
        let current = self.current.get(topic).copied();
        self.bindings.iter().filter(move |b| {
            b.topic == topic && Some(b.channel) == current && b.sink.event() == event
        })
    }
}

/// Transport double driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// Not yet connected; leave unsupported.
    pub fn new() -> Self {
        Self::default()
    }

    /// Not yet connected; leave supported.
    pub fn with_leave() -> Self {
        let transport = Self::new();
        transport.lock().supports_leave = true;
        transport
    }

    /// Already connected to a throwaway inbox.
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.lock().sink = Some(crate::transport::inbox().0);
        transport
    }

    pub fn connected_with_leave() -> Self {
        let transport = Self::connected();
        transport.lock().supports_leave = true;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following push fail synchronously.
    pub fn fail_pushes(&self, fail: bool) {
        self.lock().fail_pushes = fail;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    pub fn join_count(&self, topic: &str) -> usize {
        self.lock().joins.iter().filter(|j| j.topic == topic).count()
    }

    /// Params of every join issued for `topic`, oldest first.
    pub fn join_params(&self, topic: &str) -> Vec<Value> {
        self.lock()
            .joins
            .iter()
            .filter(|j| j.topic == topic)
            .map(|j| j.params.clone())
            .collect()
    }

    /// Answer the oldest unanswered join of `topic`.
    pub fn reply_join(&self, topic: &str, reply: Reply) -> bool {
        let slot = self
            .lock()
            .joins
            .iter_mut()
            .find(|j| j.topic == topic && j.slot.is_some())
            .and_then(|j| j.slot.take());
        slot.map(|slot| slot.complete(reply)).is_some()
    }

    /// Every push issued as `(topic, event, payload)`, oldest first.
    pub fn pushes(&self) -> Vec<(String, String, Option<Value>)> {
        self.lock()
            .pushes
            .iter()
            .map(|p| (p.topic.clone(), p.event.clone(), p.payload.clone()))
            .collect()
    }

    pub fn push_count(&self) -> usize {
        self.lock().pushes.len()
    }

    /// Answer the oldest unanswered push of `event`.
    pub fn reply_push(&self, event: &str, reply: Reply) -> bool {
        let slot = self
            .lock()
            .pushes
            .iter_mut()
            .find(|p| p.event == event && p.slot.is_some())
            .and_then(|p| p.slot.take());
        slot.map(|slot| slot.complete(reply)).is_some()
    }

    /// Raise `event` on the newest channel of `topic`. Returns how many
    /// listeners received it.
    pub fn emit(&self, topic: &str, event: &str, payload: Value) -> usize {
        let script = self.lock();
        let mut delivered = 0;
        for binding in script.live(topic, event) {
            binding.sink.deliver(payload.clone());
            delivered += 1;
        }
        delivered
    }

    /// Listeners of `event` on the newest channel of `topic`.
    pub fn listener_count(&self, topic: &str, event: &str) -> usize {
        self.lock().live(topic, event).count()
    }

    /// Terminate the newest channel of `topic` from the server side.
    pub fn close_channel(&self, topic: &str, reason: &str) -> bool {
        let mut script = self.lock();
        if script.current.remove(topic).is_none() {
            return false;
        }
        let lifecycle = script
            .joins
            .iter()
            .rev()
            .find(|j| j.topic == topic)
            .map(|j| j.lifecycle.clone());
        drop(script);
        lifecycle.map(|l| l.closed(reason)).is_some()
    }

    pub fn off_count(&self) -> usize {
        self.lock().off_count
    }

    pub fn left_topics(&self) -> Vec<String> {
        self.lock().left.clone()
    }

    /// Drop the connection and tell the session.
    pub fn disconnect(&self, reason: &str) {
        let sink = self.lock().sink.take();
        if let Some(sink) = sink {
            sink.disconnected(reason);
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        let mut script = self.lock();
        script.connect_count += 1;
        script.sink = Some(sink);
        Ok(())
    }

    fn join(
        &mut self,
        topic: &str,
        params: Value,
        reply: ReplySlot,
        lifecycle: ChannelSink,
    ) -> Result<ChannelRef, TransportError> {
        let mut script = self.lock();
        if script.sink.is_none() {
            return Err(TransportError::NotConnected);
        }
        script.next_ref += 1;
        let channel = ChannelRef(script.next_ref);
        script.channels.insert(channel, topic.to_string());
        script.current.insert(topic.to_string(), channel);
        script.joins.push(PendingJoin {
            topic: topic.to_string(),
            params,
            slot: Some(reply),
            lifecycle,
        });
        Ok(channel)
    }

    fn push(
        &mut self,
        channel: ChannelRef,
        event: &str,
        payload: Option<Value>,
        reply: ReplySlot,
    ) -> Result<(), TransportError> {
        let mut script = self.lock();
        if script.fail_pushes {
            return Err(TransportError::Closed("scripted push failure".into()));
        }
        let topic = script.topic(channel)?;
        script.pushes.push(PushRecord {
            topic,
            event: event.to_string(),
            payload,
            slot: Some(reply),
        });
        Ok(())
    }

    fn on(
        &mut self,
        channel: ChannelRef,
        _event: &str,
        sink: EventSink,
    ) -> Result<ListenerRef, TransportError> {
        let mut script = self.lock();
        let topic = script.topic(channel)?;
        script.next_ref += 1;
        let listener = ListenerRef(script.next_ref);
        script.bindings.push(Binding {
            listener,
            channel,
            topic,
            sink,
        });
        Ok(listener)
    }

    fn off(
        &mut self,
        _channel: ChannelRef,
        _event: &str,
        listener: ListenerRef,
    ) -> Result<(), TransportError> {
        let mut script = self.lock();
        let before = script.bindings.len();
        script.bindings.retain(|b| b.listener != listener);
        if script.bindings.len() == before {
            return Err(TransportError::Protocol(format!(
                "unknown listener {}",
                listener.0
            )));
        }
        script.off_count += 1;
        Ok(())
    }

    fn supports_leave(&self) -> bool {
        self.lock().supports_leave
    }

    fn leave(&mut self, channel: ChannelRef) -> Result<(), TransportError> {
        let mut script = self.lock();
        if !script.supports_leave {
            return Err(TransportError::Unsupported("leave"));
        }
        let topic = script
            .channels
            .remove(&channel)
            .ok_or_else(|| TransportError::Protocol(format!("unknown channel {}", channel.0)))?;
        if script.current.get(&topic) == Some(&channel) {
            script.current.remove(&topic);
        }
        script.left.push(topic);
        Ok(())
    }
}
