//! Socket task: owns the websocket and all Phoenix protocol state.
//!
//! [`SocketState`] is the pure part (refs, channel bindings, reply
//! correlation) so it can be tested without a server; [`run`] drives it
//! from the websocket, the command queue and the heartbeat timer.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::message::{
    Frame, PHOENIX_TOPIC, PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_LEAVE, PHX_REPLY,
};
use crate::transport::{
    ChannelRef, ChannelSink, EventSink, ListenerRef, Reply, ReplySlot, TransportError,
    TransportSink,
};

/// Work queued by [`super::PhoenixTransport`] for the socket task.
#[derive(Debug)]
pub enum SocketCommand {
    Join {
        channel: ChannelRef,
        topic: String,
        params: Value,
        reply: ReplySlot,
        lifecycle: ChannelSink,
    },
    Push {
        channel: ChannelRef,
        event: String,
        payload: Value,
        reply: ReplySlot,
    },
    On {
        channel: ChannelRef,
        listener: ListenerRef,
        sink: EventSink,
    },
    Off {
        channel: ChannelRef,
        listener: ListenerRef,
    },
    Leave {
        channel: ChannelRef,
    },
}

struct BufferedPush {
    event: String,
    payload: Value,
    reply: ReplySlot,
}

struct Channel {
    topic: String,
    join_ref: String,
    joined: bool,
    join_reply: Option<ReplySlot>,
    lifecycle: ChannelSink,
    buffered: Vec<BufferedPush>,
    bindings: Vec<(ListenerRef, EventSink)>,
}

impl Channel {
    fn fail(&mut self, reason: &str) {
        if let Some(slot) = self.join_reply.take() {
            slot.complete(Reply::reason(reason));
        }
        for push in self.buffered.drain(..) {
            push.reply.complete(Reply::reason(reason));
        }
    }
}

enum Awaiting {
    Join(ChannelRef),
    Push { channel: ChannelRef, slot: ReplySlot },
    Leave,
}

/// Phoenix protocol state for one socket.
#[derive(Default)]
pub struct SocketState {
    next_ref: u64,
    channels: HashMap<ChannelRef, Channel>,
    awaiting: HashMap<String, Awaiting>,
    heartbeat_ref: Option<String>,
}

impl SocketState {
    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// Apply a queued command, returning the frames to send.
    pub fn handle_command(&mut self, command: SocketCommand) -> Vec<Frame> {
        match command {
            SocketCommand::Join {
                channel,
                topic,
                params,
                reply,
                lifecycle,
            } => {
                let join_ref = self.make_ref();
                self.awaiting
                    .insert(join_ref.clone(), Awaiting::Join(channel));
                self.channels.insert(
                    channel,
                    Channel {
                        topic: topic.clone(),
                        join_ref: join_ref.clone(),
                        joined: false,
                        join_reply: Some(reply),
                        lifecycle,
                        buffered: Vec::new(),
                        bindings: Vec::new(),
                    },
                );
                vec![Frame::new(
                    Some(join_ref.clone()),
                    Some(join_ref),
                    topic,
                    PHX_JOIN,
                    params,
                )]
            }
            SocketCommand::Push {
                channel,
                event,
                payload,
                reply,
            } => {
                let Some(entry) = self.channels.get_mut(&channel) else {
                    reply.complete(Reply::reason("channel closed"));
                    return Vec::new();
                };
                if !entry.joined {
                    entry.buffered.push(BufferedPush {
                        event,
                        payload,
                        reply,
                    });
                    return Vec::new();
                }
                let (topic, join_ref) = (entry.topic.clone(), entry.join_ref.clone());
                vec![self.push_frame(channel, topic, join_ref, event, payload, reply)]
            }
            SocketCommand::On {
                channel,
                listener,
                sink,
            } => {
                if let Some(entry) = self.channels.get_mut(&channel) {
                    entry.bindings.push((listener, sink));
                }
                Vec::new()
            }
            SocketCommand::Off { channel, listener } => {
                if let Some(entry) = self.channels.get_mut(&channel) {
                    entry.bindings.retain(|(l, _)| *l != listener);
                }
                Vec::new()
            }
            SocketCommand::Leave { channel } => {
                let Some(mut entry) = self.channels.remove(&channel) else {
                    return Vec::new();
                };
                entry.fail("left");
                let msg_ref = self.make_ref();
                self.awaiting.insert(msg_ref.clone(), Awaiting::Leave);
                vec![Frame::new(
                    Some(entry.join_ref),
                    Some(msg_ref),
                    entry.topic,
                    PHX_LEAVE,
                    json!({}),
                )]
            }
        }
    }

    fn push_frame(
        &mut self,
        channel: ChannelRef,
        topic: String,
        join_ref: String,
        event: String,
        payload: Value,
        slot: ReplySlot,
    ) -> Frame {
        let msg_ref = self.make_ref();
        self.awaiting
            .insert(msg_ref.clone(), Awaiting::Push { channel, slot });
        Frame::new(Some(join_ref), Some(msg_ref), topic, event, payload)
    }

    /// Apply an inbound frame, returning frames to send in response.
    pub fn handle_frame(&mut self, frame: Frame) -> Vec<Frame> {
        if frame.topic == PHOENIX_TOPIC {
            if frame.event == PHX_REPLY && frame.msg_ref == self.heartbeat_ref {
                self.heartbeat_ref = None;
            }
            return Vec::new();
        }

        match frame.event.as_str() {
            PHX_REPLY => self.handle_reply(&frame),
            PHX_ERROR | PHX_CLOSE => {
                self.close_topic(&frame);
                Vec::new()
            }
            _ => {
                self.dispatch_event(&frame);
                Vec::new()
            }
        }
    }

    fn handle_reply(&mut self, frame: &Frame) -> Vec<Frame> {
        let Some(awaiting) = frame
            .msg_ref
            .as_ref()
            .and_then(|r| self.awaiting.remove(r))
        else {
            debug!(topic = %frame.topic, "Reply for unknown ref");
            return Vec::new();
        };

        match awaiting {
            Awaiting::Push { slot, .. } => {
                slot.complete(frame.reply());
                Vec::new()
            }
            Awaiting::Leave => Vec::new(),
            Awaiting::Join(channel) => self.resolve_join(channel, frame.reply()),
        }
    }

    fn resolve_join(&mut self, channel: ChannelRef, reply: Reply) -> Vec<Frame> {
        if !reply.is_ok() {
            if let Some(mut entry) = self.channels.remove(&channel) {
                if let Some(slot) = entry.join_reply.take() {
                    slot.complete(reply);
                }
                entry.fail("join failed");
            }
            return Vec::new();
        }

        let Some(entry) = self.channels.get_mut(&channel) else {
            return Vec::new();
        };
        entry.joined = true;
        if let Some(slot) = entry.join_reply.take() {
            slot.complete(reply);
        }
        let topic = entry.topic.clone();
        let join_ref = entry.join_ref.clone();
        let buffered: Vec<BufferedPush> = entry.buffered.drain(..).collect();
        buffered
            .into_iter()
            .map(|p| {
                self.push_frame(
                    channel,
                    topic.clone(),
                    join_ref.clone(),
                    p.event,
                    p.payload,
                    p.reply,
                )
            })
            .collect()
    }

    fn matching_channels(&self, frame: &Frame) -> Vec<ChannelRef> {
        self.channels
            .iter()
            .filter(|(_, c)| {
                c.topic == frame.topic
                    && frame.join_ref.as_ref().is_none_or(|r| *r == c.join_ref)
            })
            .map(|(handle, _)| *handle)
            .collect()
    }

    fn close_topic(&mut self, frame: &Frame) {
        let reason = if frame.event == PHX_ERROR {
            "channel error"
        } else {
            "channel closed"
        };
        for handle in self.matching_channels(frame) {
            let Some(mut entry) = self.channels.remove(&handle) else {
                continue;
            };
            warn!(topic = %entry.topic, reason, "Channel terminated by server");
            entry.fail(reason);
            let orphaned: Vec<String> = self
                .awaiting
                .iter()
                .filter(|(_, a)| matches!(a, Awaiting::Push { channel, .. } if *channel == handle))
                .map(|(r, _)| r.clone())
                .collect();
            for msg_ref in orphaned {
                if let Some(Awaiting::Push { slot, .. }) = self.awaiting.remove(&msg_ref) {
                    slot.complete(Reply::reason(reason));
                }
            }
            // A channel still joining learns through its join reply.
            if entry.joined {
                entry.lifecycle.closed(reason);
            }
        }
    }

    fn dispatch_event(&self, frame: &Frame) {
        for handle in self.matching_channels(frame) {
            let Some(entry) = self.channels.get(&handle) else {
                continue;
            };
            for (_, sink) in entry.bindings.iter().filter(|(_, s)| s.event() == frame.event) {
                sink.deliver(frame.payload.clone());
            }
        }
    }

    /// Next heartbeat frame, or an error if the previous one went unanswered.
    pub fn heartbeat(&mut self) -> Result<Frame, TransportError> {
        if self.heartbeat_ref.is_some() {
            return Err(TransportError::Closed("heartbeat timeout".into()));
        }
        let msg_ref = self.make_ref();
        self.heartbeat_ref = Some(msg_ref.clone());
        Ok(Frame::heartbeat(msg_ref))
    }
}

/// Connect to `url` and serve the socket until it closes, then report the
/// disconnect through `sink`.
pub async fn run(
    url: Url,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    sink: TransportSink,
) {
    let reason = match serve(&url, heartbeat_interval, connect_timeout, commands).await {
        Ok(reason) => reason,
        Err(e) => {
            warn!(url = %url, error = %e, "Socket failed");
            e.to_string()
        }
    };
    info!(url = %url, %reason, "Socket closed");
    sink.disconnected(reason);
}

async fn serve(
    url: &Url,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) -> Result<String, TransportError> {
    let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| TransportError::Connect(format!("timed out after {connect_timeout:?}")))?
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    info!(url = %url, "Socket connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut state = SocketState::default();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);

    loop {
        let frames = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => state.handle_command(command),
                None => {
                    let _ = ws_tx.close().await;
                    return Ok("transport dropped".into());
                }
            },
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => state.handle_frame(frame),
                    Err(e) => {
                        warn!(error = %e, "Ignoring undecodable frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map_or_else(
                        || "socket closed".to_string(),
                        |f| format!("socket closed: {}", f.reason.as_str()),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
                None => return Ok("socket closed".into()),
            },
            _ = heartbeat.tick() => vec![state.heartbeat()?],
        };

        for frame in frames {
            debug!(topic = %frame.topic, event = %frame.event, "Sending frame");
            ws_tx
                .send(Message::Text(frame.encode().into()))
                .await
                .map_err(|e| TransportError::Closed(e.to_string()))?;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::transport::{TransportInput, inbox};
    use chanmux_core::PushId;

    fn reply_frame(frame: &Frame, status: &str, response: Value) -> Frame {
        Frame::new(
            frame.join_ref.clone(),
            frame.msg_ref.clone(),
            frame.topic.clone(),
            PHX_REPLY,
            json!({"status": status, "response": response}),
        )
    }

    fn join(
        state: &mut SocketState,
        sink: &TransportSink,
        channel: u64,
        topic: &str,
    ) -> Frame {
        state
            .handle_command(SocketCommand::Join {
                channel: ChannelRef(channel),
                topic: topic.into(),
                params: json!({}),
                reply: sink.join_slot(topic, channel),
                lifecycle: sink.channel_sink(topic, channel),
            })
            .remove(0)
    }

    fn push(state: &mut SocketState, sink: &TransportSink, channel: u64, id: i64) -> Vec<Frame> {
        state.handle_command(SocketCommand::Push {
            channel: ChannelRef(channel),
            event: "ping".into(),
            payload: json!({}),
            reply: sink.push_slot(PushId::Int(id)),
        })
    }

    fn next(rx: &mut UnboundedReceiver<TransportInput>) -> TransportInput {
        rx.try_recv().unwrap()
    }

    #[test]
    fn join_reply_completes_slot_and_flushes_buffered_pushes() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();

        let join_frame = join(&mut state, &sink, 1, "room:lobby");
        assert_eq!(join_frame.event, PHX_JOIN);
        assert_eq!(join_frame.join_ref, join_frame.msg_ref);

        assert!(push(&mut state, &sink, 1, 10).is_empty());

        let flushed = state.handle_frame(reply_frame(&join_frame, "ok", json!({"hi": 1})));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].event, "ping");
        assert_eq!(flushed[0].join_ref, join_frame.join_ref);

        let TransportInput::JoinReply { reply, .. } = next(&mut rx) else {
            panic!("expected join reply");
        };
        assert_eq!(reply, Reply::ok(json!({"hi": 1})));

        state.handle_frame(reply_frame(&flushed[0], "error", json!({"reason": "x"})));
        let TransportInput::PushReply { id, reply } = next(&mut rx) else {
            panic!("expected push reply");
        };
        assert_eq!(id, PushId::Int(10));
        assert_eq!(reply, Reply::reason("x"));
    }

    #[test]
    fn failed_join_fails_buffered_pushes() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 1, "room:secret");
        push(&mut state, &sink, 1, 1);

        let out = state.handle_frame(reply_frame(&join_frame, "error", json!({"reason": "denied"})));
        assert!(out.is_empty());

        assert!(matches!(next(&mut rx), TransportInput::JoinReply { reply, .. } if !reply.is_ok()));
        let TransportInput::PushReply { reply, .. } = next(&mut rx) else {
            panic!("expected push reply");
        };
        assert_eq!(reply, Reply::reason("join failed"));
    }

    #[test]
    fn events_are_filtered_by_topic_and_join_ref() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 1, "room:lobby");
        state.handle_frame(reply_frame(&join_frame, "ok", json!({})));
        let _ = next(&mut rx);

        state.handle_command(SocketCommand::On {
            channel: ChannelRef(1),
            listener: ListenerRef(1),
            sink: sink.event_sink("room:lobby", "tick", 1),
        });

        state.handle_frame(Frame::new(None, None, "room:lobby", "tick", json!({"n": 1})));
        state.handle_frame(Frame::new(
            Some("stale".into()),
            None,
            "room:lobby",
            "tick",
            json!({"n": 2}),
        ));
        state.handle_frame(Frame::new(None, None, "room:other", "tick", json!({"n": 3})));
        state.handle_frame(Frame::new(None, None, "room:lobby", "tock", json!({"n": 4})));

        let TransportInput::Event { payload, .. } = next(&mut rx) else {
            panic!("expected event");
        };
        assert_eq!(payload, json!({"n": 1}));
        assert!(rx.try_recv().is_err());

        state.handle_command(SocketCommand::Off {
            channel: ChannelRef(1),
            listener: ListenerRef(1),
        });
        state.handle_frame(Frame::new(None, None, "room:lobby", "tick", json!({"n": 5})));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn phx_error_resolves_pending_join_and_pushes() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 1, "room:lobby");

        state.handle_frame(Frame::new(
            join_frame.join_ref.clone(),
            None,
            "room:lobby",
            PHX_ERROR,
            json!({}),
        ));

        let TransportInput::JoinReply { reply, .. } = next(&mut rx) else {
            panic!("expected join reply");
        };
        assert_eq!(reply, Reply::reason("channel error"));

        let late = push(&mut state, &sink, 1, 2);
        assert!(late.is_empty());
        let TransportInput::PushReply { reply, .. } = next(&mut rx) else {
            panic!("expected push reply");
        };
        assert_eq!(reply, Reply::reason("channel closed"));
    }

    #[test]
    fn phx_close_fails_in_flight_pushes() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 1, "room:lobby");
        state.handle_frame(reply_frame(&join_frame, "ok", json!({})));
        let _ = next(&mut rx);
        assert_eq!(push(&mut state, &sink, 1, 4).len(), 1);

        state.handle_frame(Frame::new(
            join_frame.join_ref,
            None,
            "room:lobby",
            PHX_CLOSE,
            json!({}),
        ));

        let TransportInput::PushReply { id, reply } = next(&mut rx) else {
            panic!("expected push reply");
        };
        assert_eq!(id, PushId::Int(4));
        assert_eq!(reply, Reply::reason("channel closed"));
        let TransportInput::ChannelClosed { name, reason, .. } = next(&mut rx) else {
            panic!("expected channel closed");
        };
        assert_eq!((name.as_str(), reason.as_str()), ("room:lobby", "channel closed"));
    }

    #[test]
    fn phx_error_on_joined_channel_reports_closure() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 3, "room:lobby");
        state.handle_frame(reply_frame(&join_frame, "ok", json!({})));
        let _ = next(&mut rx);

        state.handle_frame(Frame::new(None, None, "room:lobby", PHX_ERROR, json!({})));

        let TransportInput::ChannelClosed {
            name,
            attempt,
            reason,
        } = next(&mut rx)
        else {
            panic!("expected channel closed");
        };
        assert_eq!(name, "room:lobby");
        assert_eq!(attempt, 3);
        assert_eq!(reason, "channel error");

        // The handle is gone; later pushes fail without a frame.
        assert!(push(&mut state, &sink, 3, 1).is_empty());
        assert!(matches!(next(&mut rx), TransportInput::PushReply { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn leave_sends_phx_leave_and_answers_pending_join() {
        let (sink, mut rx) = inbox();
        let mut state = SocketState::default();
        let join_frame = join(&mut state, &sink, 1, "room:lobby");

        let frames = state.handle_command(SocketCommand::Leave {
            channel: ChannelRef(1),
        });
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, PHX_LEAVE);
        assert_eq!(frames[0].join_ref, join_frame.join_ref);

        let TransportInput::JoinReply { reply, .. } = next(&mut rx) else {
            panic!("expected join reply");
        };
        assert_eq!(reply, Reply::reason("left"));

        // The late server reply to the join is ignored.
        assert!(
            state
                .handle_frame(reply_frame(&join_frame, "ok", json!({})))
                .is_empty()
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unanswered_heartbeat_is_a_timeout() {
        let mut state = SocketState::default();
        let beat = state.heartbeat().unwrap();
        assert_eq!(beat.topic, PHOENIX_TOPIC);

        state.handle_frame(reply_frame(&beat, "ok", json!({})));
        assert!(state.heartbeat().is_ok());

        assert!(state.heartbeat().is_err());
    }
}
