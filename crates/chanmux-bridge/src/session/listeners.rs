//! Event listener table keyed by (channel, event).
//!
//! Every inbound event is checked against this table before it reaches the
//! application, so an event raised by a listener that has since been
//! replaced or removed is dropped even if it was already queued.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::transport::{ChannelRef, ListenerRef, Transport, TransportError, TransportSink};

#[derive(Debug, Clone, Copy)]
struct Subscription {
    listener: ListenerRef,
    id: u64,
}

/// Currently active listener per (channel, event).
#[derive(Debug, Default)]
pub struct ListenerTable {
    channels: HashMap<String, HashMap<String, Subscription>>,
    next_id: u64,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `event` on `channel`, detaching any previous
    /// listener for the same key first.
    ///
    /// Returns whether a previous listener was replaced.
    pub fn set<T: Transport + ?Sized>(
        &mut self,
        channel: &str,
        handle: ChannelRef,
        event: &str,
        transport: &mut T,
        sink: &TransportSink,
    ) -> Result<bool, TransportError> {
        let replaced = self.clear(channel, handle, event, transport);

        self.next_id += 1;
        let id = self.next_id;
        let listener = transport.on(handle, event, sink.event_sink(channel, event, id))?;
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(event.to_string(), Subscription { listener, id });

        debug!(channel, event, subscription = id, replaced, "Listener set");
        Ok(replaced)
    }

    pub fn get(&self, channel: &str, event: &str) -> Option<ListenerRef> {
        self.channels
            .get(channel)
            .and_then(|events| events.get(event))
            .map(|s| s.listener)
    }

    /// Detach and remove the listener for (channel, event).
    ///
    /// Returns `false` when there was none.
    pub fn clear<T: Transport + ?Sized>(
        &mut self,
        channel: &str,
        handle: ChannelRef,
        event: &str,
        transport: &mut T,
    ) -> bool {
        let Some(events) = self.channels.get_mut(channel) else {
            return false;
        };
        let Some(subscription) = events.remove(event) else {
            return false;
        };
        if events.is_empty() {
            self.channels.remove(channel);
        }

        detach(transport, channel, handle, event, subscription.listener);
        true
    }

    /// Detach every listener of `channel`. Returns how many were removed.
    pub fn clear_channel<T: Transport + ?Sized>(
        &mut self,
        channel: &str,
        handle: ChannelRef,
        transport: &mut T,
    ) -> usize {
        let Some(events) = self.channels.remove(channel) else {
            return 0;
        };
        let count = events.len();
        for (event, subscription) in events {
            detach(transport, channel, handle, &event, subscription.listener);
        }
        count
    }

    /// Move every listener of `channel` from the dead handle `previous` to
    /// `handle`, each under a fresh subscription id.
    ///
    /// Returns the events that could not be re-attached; those are removed.
    pub fn rebind<T: Transport + ?Sized>(
        &mut self,
        channel: &str,
        previous: ChannelRef,
        handle: ChannelRef,
        transport: &mut T,
        sink: &TransportSink,
    ) -> Vec<String> {
        let Some(events) = self.channels.get_mut(channel) else {
            return Vec::new();
        };

        let mut failed = Vec::new();
        for (event, subscription) in events.iter_mut() {
            detach(transport, channel, previous, event, subscription.listener);
            self.next_id += 1;
            let id = self.next_id;
            match transport.on(handle, event, sink.event_sink(channel, event, id)) {
                Ok(listener) => *subscription = Subscription { listener, id },
                Err(e) => {
                    warn!(channel, event = %event, error = %e, "Failed to re-attach listener");
                    failed.push(event.clone());
                }
            }
        }
        events.retain(|event, _| !failed.contains(event));
        if events.is_empty() {
            self.channels.remove(channel);
        }
        debug!(channel, failed = failed.len(), "Listeners rebound");
        failed
    }

    /// Forget every listener without detaching; the transport is gone.
    pub(crate) fn reset(&mut self) {
        self.channels.clear();
    }

    /// Whether `subscription` is the active listener for (channel, event).
    pub fn is_current(&self, channel: &str, event: &str, subscription: u64) -> bool {
        self.channels
            .get(channel)
            .and_then(|events| events.get(event))
            .is_some_and(|s| s.id == subscription)
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

fn detach<T: Transport + ?Sized>(
    transport: &mut T,
    channel: &str,
    handle: ChannelRef,
    event: &str,
    listener: ListenerRef,
) {
    if let Err(e) = transport.off(handle, event, listener) {
        warn!(channel, event, error = %e, "Failed to detach listener");
    }
}
