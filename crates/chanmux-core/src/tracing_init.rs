//! Shared tracing/logging initialization.
//!
//! The bridge owns stdout for notifications, so every log line goes to
//! stderr regardless of format.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter directive applying `level` to every chanmux crate.
pub fn crate_filter(level: &str) -> String {
    ["chanmux", "chanmux_bridge", "chanmux_core"]
        .map(|target| format!("{target}={level}"))
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is unset or invalid
///   (e.g. the output of [`crate_filter`]).
/// * `log_json` -- emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}
