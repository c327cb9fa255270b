//! Phoenix channels transport over a websocket.
//!
//! The [`Transport`] methods never block: they allocate handles and queue
//! a [`SocketCommand`] for the socket task spawned by `connect`.

mod message;
mod socket;

use std::collections::BTreeMap;
use std::time::Duration;

use chanmux_core::config::SocketConfig;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;
use url::Url;

use socket::SocketCommand;

use super::{
    ChannelRef, ChannelSink, EventSink, ListenerRef, ReplySlot, Transport, TransportError,
    TransportSink,
};

/// Phoenix socket settings.
#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Socket endpoint without the `/websocket` suffix.
    pub endpoint: String,
    /// Connect params sent as query parameters.
    pub params: BTreeMap<String, String>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
}

impl From<&SocketConfig> for PhoenixConfig {
    fn from(config: &SocketConfig) -> Self {
        Self {
            endpoint: config.url.clone(),
            params: config.params.clone(),
            heartbeat_interval: config.heartbeat_interval().max(Duration::from_secs(1)),
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl PhoenixConfig {
    /// Full websocket URL: scheme mapped to ws/wss, `/websocket` appended,
    /// connect params and the serializer version in the query.
    pub fn websocket_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint {}: {e}", self.endpoint)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported endpoint scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::Connect(format!("cannot use scheme {scheme}")))?;

        let path = format!("{}/websocket", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.query_pairs_mut()
            .extend_pairs(&self.params)
            .append_pair("vsn", message::VSN);
        Ok(url)
    }
}

/// [`Transport`] speaking the Phoenix channels protocol.
pub struct PhoenixTransport {
    config: PhoenixConfig,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
    next_ref: u64,
}

impl PhoenixTransport {
    pub const fn new(config: PhoenixConfig) -> Self {
        Self {
            config,
            commands: None,
            next_ref: 0,
        }
    }

    pub const fn config(&self) -> &PhoenixConfig {
        &self.config
    }

    const fn make_ref(&mut self) -> u64 {
        self.next_ref += 1;
        self.next_ref
    }

    fn send(&self, command: SocketCommand) -> Result<(), TransportError> {
        self.commands
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .send(command)
            .map_err(|_| TransportError::Closed("socket task ended".into()))
    }
}

impl Transport for PhoenixTransport {
    fn connect(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        if self.commands.is_some() {
            return Ok(());
        }
        let url = self.config.websocket_url()?;
        let runtime =
            Handle::try_current().map_err(|e| TransportError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        info!(url = %url, "Opening socket");
        runtime.spawn(socket::run(
            url,
            self.config.heartbeat_interval,
            self.config.connect_timeout,
            rx,
            sink,
        ));
        self.commands = Some(tx);
        Ok(())
    }

    fn join(
        &mut self,
        topic: &str,
        params: Value,
        reply: ReplySlot,
        lifecycle: ChannelSink,
    ) -> Result<ChannelRef, TransportError> {
        let channel = ChannelRef(self.make_ref());
        self.send(SocketCommand::Join {
            channel,
            topic: topic.to_string(),
            params,
            reply,
            lifecycle,
        })?;
        Ok(channel)
    }

    fn push(
        &mut self,
        channel: ChannelRef,
        event: &str,
        payload: Option<Value>,
        reply: ReplySlot,
    ) -> Result<(), TransportError> {
        self.send(SocketCommand::Push {
            channel,
            event: event.to_string(),
            payload: payload.unwrap_or_else(|| json!({})),
            reply,
        })
    }

    fn on(
        &mut self,
        channel: ChannelRef,
        _event: &str,
        sink: EventSink,
    ) -> Result<ListenerRef, TransportError> {
        let listener = ListenerRef(self.make_ref());
        self.send(SocketCommand::On {
            channel,
            listener,
            sink,
        })?;
        Ok(listener)
    }

    fn off(
        &mut self,
        channel: ChannelRef,
        _event: &str,
        listener: ListenerRef,
    ) -> Result<(), TransportError> {
        self.send(SocketCommand::Off { channel, listener })
    }

    fn supports_leave(&self) -> bool {
        true
    }

    fn leave(&mut self, channel: ChannelRef) -> Result<(), TransportError> {
        self.send(SocketCommand::Leave { channel })
    }
}
