//! Session multiplexer: one dispatch loop per transport connection.
//!
//! Application commands and transport input (replies, events, disconnects)
//! are serialized through [`SessionMultiplexer::run`], which owns every
//! table, so nothing here is shared or locked.

use chanmux_core::{Command, Notification, PushId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::listeners::ListenerTable;
use super::registry::ChannelRegistry;
use super::router::{CommandRouter, RouteContext};
use super::types::{ChannelState, MultiplexerConfig, MultiplexerStats, SessionEnd};
use crate::transport::{Transport, TransportError, TransportInput, TransportSink, inbox};

/// Multiplexes many logical channels over one transport connection.
pub struct SessionMultiplexer<T: Transport> {
    transport: T,
    registry: ChannelRegistry,
    listeners: ListenerTable,
    router: CommandRouter,
    sink: TransportSink,
    inbox: mpsc::UnboundedReceiver<TransportInput>,
    config: MultiplexerConfig,
    connected: bool,
}

/// Application side of a running session.
pub struct SessionHandle {
    pub commands: mpsc::Sender<Command>,
    pub notifications: mpsc::Receiver<Notification>,
    pub task: JoinHandle<Result<SessionEnd, TransportError>>,
}

impl SessionHandle {
    /// Close the command stream and wait for teardown.
    pub async fn close(self) -> Result<SessionEnd, TransportError> {
        let Self {
            commands,
            notifications,
            task,
        } = self;
        drop(commands);
        // Keep draining so the loop never blocks on a full queue.
        let drain = tokio::spawn(async move {
            let mut notifications = notifications;
            while notifications.recv().await.is_some() {}
        });
        let end = task
            .await
            .map_err(|e| TransportError::Closed(format!("session task failed: {e}")))?;
        drain.abort();
        end
    }
}

impl<T: Transport> SessionMultiplexer<T> {
    pub fn new(transport: T, config: MultiplexerConfig) -> Self {
        let (sink, inbox) = inbox();
        Self {
            transport,
            registry: ChannelRegistry::new(),
            listeners: ListenerTable::new(),
            router: CommandRouter::new(config.leave_channels),
            sink,
            inbox,
            config,
            connected: false,
        }
    }

    pub fn with_defaults(transport: T) -> Self {
        Self::new(transport, MultiplexerConfig::default())
    }

    /// Connect the transport. A second call is a no-op.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        self.transport.connect(self.sink.clone())?;
        self.connected = true;
        info!("Transport connected");
        Ok(())
    }

    /// Apply one application command.
    ///
    /// Routing failures come back as [`Notification::CommandRejected`].
    pub fn handle_command(&mut self, command: Command) -> Option<Notification> {
        debug!(kind = command.kind(), channel = command.channel(), "Command");
        let result = self.router.route(
            &command,
            RouteContext {
                registry: &mut self.registry,
                listeners: &mut self.listeners,
                transport: &mut self.transport,
                sink: &self.sink,
            },
        );
        match result {
            Ok(notification) => notification,
            Err(error) => {
                warn!(kind = command.kind(), error = %error, "Command rejected");
                Some(Notification::CommandRejected { command, error })
            }
        }
    }

    /// Apply one transport reply, event or disconnect.
    pub fn handle_input(&mut self, input: TransportInput) -> Option<Notification> {
        match input {
            TransportInput::Disconnected { reason } => Some(self.close(reason)),
            TransportInput::ChannelClosed {
                name,
                attempt,
                reason,
            } => self.channel_closed(name, attempt, reason),
            input => self
                .router
                .resolve(input, &mut self.registry, &self.listeners),
        }
    }

    /// The server ended a joined channel; forget it and its listeners.
    fn channel_closed(
        &mut self,
        name: String,
        attempt: u64,
        reason: String,
    ) -> Option<Notification> {
        let Some(entry) = self.registry.close(&name, attempt) else {
            debug!(channel = %name, attempt, "Ignoring close of stale channel");
            return None;
        };
        let dropped = self
            .listeners
            .clear_channel(&name, entry.handle, &mut self.transport);
        warn!(channel = %name, %reason, subscriptions = dropped, "Channel closed by server");
        Some(Notification::ChannelClosed { name, reason })
    }

    /// Drain already-queued transport input without waiting.
    pub fn poll_inbox(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(input) = self.inbox.try_recv() {
            if let Some(notification) = self.handle_input(input) {
                out.push(notification);
            }
        }
        out
    }

    fn close(&mut self, reason: String) -> Notification {
        let abandoned_pushes = self.router.abandon();
        let unresolved_joins = self.registry.names_in(ChannelState::Joining);
        let channels = self.registry.drain().len();
        self.listeners.reset();
        self.connected = false;

        warn!(
            %reason,
            channels,
            abandoned = abandoned_pushes.len(),
            unresolved = unresolved_joins.len(),
            "Session closed by transport"
        );
        Notification::SessionClosed {
            reason,
            abandoned_pushes,
            unresolved_joins,
        }
    }

    /// Tear the session down while the transport is still up.
    ///
    /// Detaches every listener, leaves every channel that did not fail to
    /// join (when leave is enabled and supported) and returns the ids of
    /// pushes that will never be answered.
    pub fn shutdown(&mut self) -> Vec<PushId> {
        let leave = self.config.leave_channels && self.transport.supports_leave();
        for entry in self.registry.drain() {
            self.listeners
                .clear_channel(&entry.name, entry.handle, &mut self.transport);
            if leave
                && entry.state != ChannelState::JoinFailed
                && let Err(e) = self.transport.leave(entry.handle)
            {
                warn!(channel = %entry.name, error = %e, "Transport leave failed");
            }
        }
        let abandoned = self.router.abandon();
        info!(abandoned = abandoned.len(), leave, "Session shut down");
        abandoned
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            channel_count: self.registry.len(),
            joined_count: self.registry.count_in(ChannelState::Joined),
            subscription_count: self.listeners.len(),
            pending_pushes: self.router.pending_count(),
        }
    }

    pub const fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub const fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Run the dispatch loop until the command stream ends, the
    /// notification receiver is dropped or the transport disconnects.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        notifications: mpsc::Sender<Notification>,
    ) -> Result<SessionEnd, TransportError> {
        self.connect()?;

        let end = loop {
            let notification = tokio::select! {
                Some(input) = self.inbox.recv() => {
                    if let TransportInput::Disconnected { reason } = &input {
                        let reason = reason.clone();
                        if let Some(closed) = self.handle_input(input) {
                            let _ = notifications.send(closed).await;
                        }
                        break SessionEnd::Disconnected { reason };
                    }
                    self.handle_input(input)
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break SessionEnd::CommandsClosed,
                },
            };

            if let Some(notification) = notification
                && notifications.send(notification).await.is_err()
            {
                break SessionEnd::NotificationsClosed;
            }
        };

        if !matches!(end, SessionEnd::Disconnected { .. }) {
            self.shutdown();
        }
        info!(?end, "Session ended");
        Ok(end)
    }

    /// Spawn [`Self::run`] on the current runtime with fresh queues.
    pub fn start(self) -> SessionHandle
    where
        T: 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity);
        let (notification_tx, notification_rx) = mpsc::channel(self.config.notification_capacity);
        let task = tokio::spawn(self.run(command_rx, notification_tx));
        SessionHandle {
            commands: command_tx,
            notifications: notification_rx,
            task,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chanmux_core::RouteError;
    use serde_json::json;

    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::transport::Reply;

    fn session() -> (SessionMultiplexer<ScriptedTransport>, ScriptedTransport) {
        let transport = ScriptedTransport::with_leave();
        let mut mux = SessionMultiplexer::with_defaults(transport.clone());
        mux.connect().unwrap();
        (mux, transport)
    }

    fn join(name: &str) -> Command {
        Command::Join {
            name: name.into(),
            params: json!({}),
        }
    }

    #[test]
    fn connect_is_idempotent() {
        let (mut mux, transport) = session();
        mux.connect().unwrap();
        assert_eq!(transport.connect_count(), 1);
    }

    #[test]
    fn join_then_push_error_scenario() {
        let (mut mux, transport) = session();

        assert!(mux.handle_command(join("lobby")).is_none());
        transport.reply_join("lobby", Reply::ok(json!({})));
        assert_eq!(
            mux.poll_inbox(),
            vec![Notification::JoinOk {
                name: "lobby".into(),
                payload: json!({}),
            }]
        );

        assert!(
            mux.handle_command(Command::Push {
                channel: "lobby".into(),
                id: PushId::Int(1),
                event: "ping".into(),
                payload: None,
            })
            .is_none()
        );
        transport.reply_push("ping", Reply::reason("x"));
        assert_eq!(
            mux.poll_inbox(),
            vec![Notification::PushError {
                id: PushId::Int(1),
                payload: json!({"reason": "x"}),
            }]
        );
        assert_eq!(mux.stats().pending_pushes, 0);
    }

    #[test]
    fn subscribe_twice_fires_once_per_event() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        transport.reply_join("lobby", Reply::ok(json!({})));
        mux.poll_inbox();

        let subscribe = Command::Subscribe {
            channel: "lobby".into(),
            event: "tick".into(),
        };
        assert!(mux.handle_command(subscribe.clone()).is_none());
        assert!(mux.handle_command(subscribe).is_none());
        assert_eq!(transport.listener_count("lobby", "tick"), 1);

        transport.emit("lobby", "tick", json!({"n": 1}));
        transport.emit("lobby", "tick", json!({"n": 2}));
        let events = mux.poll_inbox();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            Notification::EventReceived {
                channel: "lobby".into(),
                event: "tick".into(),
                payload: json!({"n": 2}),
            }
        );
    }

    #[test]
    fn events_queued_before_unsubscribe_are_dropped() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        transport.reply_join("lobby", Reply::ok(json!({})));
        mux.poll_inbox();
        mux.handle_command(Command::Subscribe {
            channel: "lobby".into(),
            event: "tick".into(),
        });

        transport.emit("lobby", "tick", json!({"n": 1}));
        mux.handle_command(Command::Unsubscribe {
            channel: "lobby".into(),
            event: "tick".into(),
        });

        assert!(mux.poll_inbox().is_empty());
    }

    #[test]
    fn routing_errors_become_command_rejected() {
        let (mut mux, _transport) = session();
        let command = Command::Push {
            channel: "nowhere".into(),
            id: PushId::from("a"),
            event: "ping".into(),
            payload: Some(json!({})),
        };

        let rejected = mux.handle_command(command.clone()).unwrap();
        assert_eq!(
            rejected,
            Notification::CommandRejected {
                command,
                error: RouteError::ChannelNotFound {
                    channel: "nowhere".into()
                },
            }
        );
    }

    #[test]
    fn disconnect_closes_session_with_abandoned_state() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        transport.reply_join("lobby", Reply::ok(json!({})));
        mux.poll_inbox();
        mux.handle_command(join("game:7"));
        mux.handle_command(Command::Push {
            channel: "lobby".into(),
            id: PushId::Int(3),
            event: "ping".into(),
            payload: None,
        });

        transport.disconnect("socket closed");
        let notes = mux.poll_inbox();
        assert_eq!(
            notes,
            vec![Notification::SessionClosed {
                reason: "socket closed".into(),
                abandoned_pushes: vec![PushId::Int(3)],
                unresolved_joins: vec!["game:7".into()],
            }]
        );
        assert_eq!(mux.stats().channel_count, 0);
        assert_eq!(mux.stats().pending_pushes, 0);
    }

    #[test]
    fn shutdown_leaves_only_channels_that_joined_or_are_joining() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        mux.handle_command(join("room:1"));
        transport.reply_join("lobby", Reply::ok(json!({})));
        transport.reply_join("room:1", Reply::reason("denied"));
        mux.poll_inbox();
        mux.handle_command(join("game:2"));

        mux.shutdown();

        let mut left = transport.left_topics();
        left.sort();
        assert_eq!(left, vec!["game:2", "lobby"]);
        assert_eq!(mux.stats().channel_count, 0);
    }

    #[test]
    fn shutdown_without_leave_detaches_locally() {
        let transport = ScriptedTransport::with_leave();
        let mut mux = SessionMultiplexer::new(
            transport.clone(),
            MultiplexerConfig {
                leave_channels: false,
                ..MultiplexerConfig::default()
            },
        );
        mux.connect().unwrap();
        mux.handle_command(join("lobby"));

        mux.shutdown();
        assert!(transport.left_topics().is_empty());
        assert!(mux.registry().is_empty());
    }

    #[test]
    fn server_close_forgets_channel_and_listeners() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        transport.reply_join("lobby", Reply::ok(json!({})));
        mux.poll_inbox();
        mux.handle_command(Command::Subscribe {
            channel: "lobby".into(),
            event: "tick".into(),
        });

        assert!(transport.close_channel("lobby", "channel error"));
        assert_eq!(
            mux.poll_inbox(),
            vec![Notification::ChannelClosed {
                name: "lobby".into(),
                reason: "channel error".into(),
            }]
        );
        assert!(mux.registry().lookup("lobby").is_none());
        assert_eq!(transport.off_count(), 1);

        let rejected = mux.handle_command(Command::Push {
            channel: "lobby".into(),
            id: PushId::Int(1),
            event: "ping".into(),
            payload: None,
        });
        assert!(matches!(
            rejected,
            Some(Notification::CommandRejected {
                error: RouteError::ChannelNotFound { .. },
                ..
            })
        ));

        // A fresh join goes back to the transport.
        assert!(mux.handle_command(join("lobby")).is_none());
        assert_eq!(transport.join_count("lobby"), 2);
    }

    #[test]
    fn close_of_failed_attempt_is_ignored() {
        let (mut mux, transport) = session();
        mux.handle_command(join("lobby"));
        transport.reply_join("lobby", Reply::reason("denied"));
        mux.poll_inbox();

        assert!(transport.close_channel("lobby", "channel closed"));
        assert!(mux.poll_inbox().is_empty());
        assert_eq!(
            mux.registry().lookup("lobby").unwrap().state,
            ChannelState::JoinFailed
        );
    }

    #[tokio::test]
    async fn run_returns_when_commands_close() {
        let transport = ScriptedTransport::with_leave();
        let handle = SessionMultiplexer::with_defaults(transport.clone()).start();

        handle.commands.send(join("lobby")).await.unwrap();
        let end = handle.close().await.unwrap();

        assert_eq!(end, SessionEnd::CommandsClosed);
        assert_eq!(transport.left_topics(), vec!["lobby"]);
    }
}
