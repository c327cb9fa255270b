//! Command router: one operation per application command, plus the
//! translation of transport replies and events back into notifications.

use std::collections::HashMap;
use std::time::Instant;

use chanmux_core::{Command, Notification, PushId, RouteError};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::listeners::ListenerTable;
use super::registry::{ChannelRegistry, OpenOutcome};
use super::types::ChannelState;
use crate::transport::{Transport, TransportInput, TransportSink};

/// A push awaiting its terminal reply.
#[derive(Debug, Clone)]
pub struct PendingPush {
    pub channel: String,
    pub event: String,
    pub issued_at: Instant,
    /// Issue order; `Instant` can tie.
    pub seq: u64,
}

/// Session tables a command is routed against.
pub struct RouteContext<'a, T: ?Sized> {
    pub registry: &'a mut ChannelRegistry,
    pub listeners: &'a mut ListenerTable,
    pub transport: &'a mut T,
    pub sink: &'a TransportSink,
}

/// Routes commands to the transport and correlates their replies.
#[derive(Debug)]
pub struct CommandRouter {
    pending: HashMap<PushId, PendingPush>,
    next_seq: u64,
    leave_channels: bool,
}

impl CommandRouter {
    pub fn new(leave_channels: bool) -> Self {
        Self {
            pending: HashMap::new(),
            next_seq: 0,
            leave_channels,
        }
    }

    /// Route one command.
    ///
    /// `Ok(Some(_))` is a notification that answers the command right away;
    /// `Ok(None)` means the answer (if any) arrives with a transport reply.
    pub fn route<T: Transport + ?Sized>(
        &mut self,
        command: &Command,
        ctx: RouteContext<'_, T>,
    ) -> Result<Option<Notification>, RouteError> {
        match command {
            Command::Join { name, params } => Ok(Self::join(name, params, ctx)),
            Command::Push {
                channel,
                id,
                event,
                payload,
            } => self.push(channel, id, event, payload.as_ref(), ctx),
            Command::Subscribe { channel, event } => Self::subscribe(channel, event, ctx),
            Command::Unsubscribe { channel, event } => Self::unsubscribe(channel, event, ctx),
            Command::Leave { name } => self.leave(name, ctx),
        }
    }

    fn join<T: Transport + ?Sized>(
        name: &str,
        params: &Value,
        ctx: RouteContext<'_, T>,
    ) -> Option<Notification> {
        match ctx
            .registry
            .open(name, params.clone(), ctx.transport, ctx.sink)
        {
            Ok(OpenOutcome::Existing {
                state: ChannelState::Joined,
                ..
            }) => {
                let payload = ctx
                    .registry
                    .lookup(name)
                    .and_then(|e| e.last_reply.clone())
                    .unwrap_or_else(|| json!({}));
                Some(Notification::JoinOk {
                    name: name.to_string(),
                    payload,
                })
            }
            // The failed attempt's listeners were bound to its dead handle.
            Ok(OpenOutcome::Rejoining { handle, previous }) => {
                let failed =
                    ctx.listeners
                        .rebind(name, previous, handle, &mut *ctx.transport, ctx.sink);
                if !failed.is_empty() {
                    warn!(channel = name, events = ?failed, "Subscriptions dropped on rejoin");
                }
                None
            }
            // Still joining: the pending reply answers this command too.
            Ok(_) => None,
            Err(e) => {
                warn!(channel = name, error = %e, "Transport refused join");
                Some(Notification::JoinError {
                    name: name.to_string(),
                    payload: json!({ "reason": e.to_string() }),
                })
            }
        }
    }

    fn push<T: Transport + ?Sized>(
        &mut self,
        channel: &str,
        id: &PushId,
        event: &str,
        payload: Option<&Value>,
        ctx: RouteContext<'_, T>,
    ) -> Result<Option<Notification>, RouteError> {
        let handle = ctx
            .registry
            .lookup(channel)
            .ok_or_else(|| RouteError::ChannelNotFound {
                channel: channel.to_string(),
            })?
            .handle;
        if self.pending.contains_key(id) {
            return Err(RouteError::DuplicatePushId { id: id.clone() });
        }

        if let Err(e) = ctx.transport.push(
            handle,
            event,
            payload.cloned(),
            ctx.sink.push_slot(id.clone()),
        ) {
            warn!(channel, %id, event, error = %e, "Transport refused push");
            return Ok(Some(Notification::PushError {
                id: id.clone(),
                payload: json!({ "reason": e.to_string() }),
            }));
        }

        self.next_seq += 1;
        self.pending.insert(
            id.clone(),
            PendingPush {
                channel: channel.to_string(),
                event: event.to_string(),
                issued_at: Instant::now(),
                seq: self.next_seq,
            },
        );
        debug!(channel, %id, event, "Push issued");
        Ok(None)
    }

    fn subscribe<T: Transport + ?Sized>(
        channel: &str,
        event: &str,
        ctx: RouteContext<'_, T>,
    ) -> Result<Option<Notification>, RouteError> {
        let handle = lookup_handle(ctx.registry, channel)?;
        let replaced = ctx
            .listeners
            .set(channel, handle, event, ctx.transport, ctx.sink)
            .map_err(|e| RouteError::Transport {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        info!(channel, event, replaced, "Subscribed");
        Ok(None)
    }

    fn unsubscribe<T: Transport + ?Sized>(
        channel: &str,
        event: &str,
        ctx: RouteContext<'_, T>,
    ) -> Result<Option<Notification>, RouteError> {
        let handle = lookup_handle(ctx.registry, channel)?;
        if !ctx.listeners.clear(channel, handle, event, ctx.transport) {
            return Err(RouteError::SubscriptionNotFound {
                channel: channel.to_string(),
                event: event.to_string(),
            });
        }
        info!(channel, event, "Unsubscribed");
        Ok(None)
    }

    fn leave<T: Transport + ?Sized>(
        &self,
        name: &str,
        ctx: RouteContext<'_, T>,
    ) -> Result<Option<Notification>, RouteError> {
        let entry = ctx
            .registry
            .remove(name)
            .ok_or_else(|| RouteError::ChannelNotFound {
                channel: name.to_string(),
            })?;
        let dropped = ctx
            .listeners
            .clear_channel(name, entry.handle, &mut *ctx.transport);

        let notify_transport = self.leave_channels && ctx.transport.supports_leave();
        if notify_transport && let Err(e) = ctx.transport.leave(entry.handle) {
            warn!(channel = name, error = %e, "Transport leave failed");
        }

        info!(
            channel = name,
            subscriptions = dropped,
            transport_leave = notify_transport,
            "Left channel"
        );
        Ok(Some(Notification::Left {
            name: name.to_string(),
        }))
    }

    /// Translate a transport reply or event into a notification.
    ///
    /// Stale join replies, replies for unknown push ids and events from
    /// detached listeners produce nothing.
    pub fn resolve(
        &mut self,
        input: TransportInput,
        registry: &mut ChannelRegistry,
        listeners: &ListenerTable,
    ) -> Option<Notification> {
        match input {
            TransportInput::JoinReply {
                name,
                attempt,
                reply,
            } => {
                let Some(state) = registry.resolve(&name, attempt, &reply) else {
                    debug!(channel = %name, attempt, "Discarding stale join reply");
                    return None;
                };
                if state == ChannelState::Joined {
                    info!(channel = %name, "Joined channel");
                    Some(Notification::JoinOk {
                        name,
                        payload: reply.payload,
                    })
                } else {
                    warn!(channel = %name, payload = %reply.payload, "Join failed");
                    Some(Notification::JoinError {
                        name,
                        payload: reply.payload,
                    })
                }
            }
            TransportInput::PushReply { id, reply } => {
                let Some(pending) = self.pending.remove(&id) else {
                    warn!(%id, "Reply for unknown push id");
                    return None;
                };
                debug!(
                    channel = %pending.channel,
                    event = %pending.event,
                    %id,
                    ok = reply.is_ok(),
                    elapsed_ms = u64::try_from(pending.issued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Push resolved"
                );
                Some(if reply.is_ok() {
                    Notification::PushOk {
                        id,
                        payload: reply.payload,
                    }
                } else {
                    Notification::PushError {
                        id,
                        payload: reply.payload,
                    }
                })
            }
            TransportInput::Event {
                channel,
                event,
                subscription,
                payload,
            } => {
                if !listeners.is_current(&channel, &event, subscription) {
                    debug!(%channel, %event, subscription, "Dropping event from detached listener");
                    return None;
                }
                Some(Notification::EventReceived {
                    channel,
                    event,
                    payload,
                })
            }
            TransportInput::ChannelClosed { .. } | TransportInput::Disconnected { .. } => None,
        }
    }

    /// Forget every pending push, oldest first.
    pub fn abandon(&mut self) -> Vec<PushId> {
        let mut pending: Vec<(PushId, PendingPush)> = self.pending.drain().collect();
        pending.sort_by_key(|(_, p)| p.seq);
        pending.into_iter().map(|(id, _)| id).collect()
    }

    pub fn is_pending(&self, id: &PushId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn lookup_handle(
    registry: &ChannelRegistry,
    channel: &str,
) -> Result<crate::transport::ChannelRef, RouteError> {
    registry
        .lookup(channel)
        .map(|e| e.handle)
        .ok_or_else(|| RouteError::ChannelNotFound {
            channel: channel.to_string(),
        })
}
