//! `chanmux` bridge binary
//!
//! Reads NDJSON commands on stdin, drives one channel session over a
//! Phoenix socket and writes NDJSON notifications on stdout. Logs go to
//! stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use chanmux_bridge::session::{MultiplexerConfig, SessionEnd, SessionMultiplexer};
use chanmux_bridge::stdio::{forward_commands, write_notification};
use chanmux_bridge::transport::{PhoenixConfig, PhoenixTransport};
use chanmux_core::config::load_config;
use chanmux_core::tracing_init::{crate_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "chanmux")]
#[command(version, about = "chanmux - channel session multiplexer over a Phoenix socket")]
struct Args {
    /// Socket endpoint (e.g. "ws://localhost:4000/socket")
    #[arg(long, env = "CHANMUX_SOCKET_URL")]
    url: Option<String>,

    /// Connect param sent with the socket handshake, as KEY=VALUE. Repeatable.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Directory searched for `.chanmux/settings.json`
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Seconds between heartbeats
    #[arg(long, env = "CHANMUX_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<u64>,

    /// Detach channels locally instead of sending a leave to the server.
    #[arg(long)]
    no_leave: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, env = "CHANMUX_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CHANMUX_LOG_JSON")]
    log_json: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match args.project_dir {
        Some(dir) => Some(dir),
        None => std::env::current_dir().ok(),
    };
    let mut config = load_config(project_dir.as_deref()).context("loading configuration")?;
    if let Some(url) = args.url {
        config.socket.url = url;
    }
    config.socket.params.extend(args.params);
    if let Some(secs) = args.heartbeat_interval {
        config.socket.heartbeat_interval_secs = secs;
    }
    if args.no_leave {
        config.session.leave_channels = false;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let log_filter = crate_filter(&config.log_level);
    init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.socket.url,
        leave_channels = config.session.leave_channels,
        "Starting chanmux"
    );

    let transport = PhoenixTransport::new(PhoenixConfig::from(&config.socket));
    let session =
        SessionMultiplexer::new(transport, MultiplexerConfig::from(&config.session)).start();
    let mut notifications = session.notifications;
    let task = session.task;

    let reader = tokio::spawn(forward_commands(
        BufReader::new(tokio::io::stdin()),
        session.commands,
    ));

    let mut stdout = tokio::io::stdout();
    let mut interrupted = false;
    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                if let Err(e) = write_notification(&mut stdout, &notification).await {
                    warn!(error = %e, "Failed to write notification, stopping");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!("Received Ctrl+C, closing session");
                interrupted = true;
                reader.abort();
            }
        }
    }
    drop(notifications);

    let end = task.await.context("session task panicked")??;
    match end {
        SessionEnd::Disconnected { reason } => {
            anyhow::bail!("socket disconnected: {reason}")
        }
        other => {
            info!(end = ?other, "Session finished");
            Ok(())
        }
    }
}
