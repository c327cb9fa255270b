//! Configuration resolution for chanmux.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/chanmux/settings.json)
//! 3. Project config (.chanmux/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Complete chanmux configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            session: SessionConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Socket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Socket endpoint, e.g. `ws://localhost:4000/socket`.
    pub url: String,
    /// Connect params appended to the endpoint query string.
    pub params: BTreeMap<String, String>,
    pub heartbeat_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:4000/socket".to_string(),
            params: BTreeMap::new(),
            heartbeat_interval_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl SocketConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Session multiplexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Send a transport leave when a channel is left or the session ends.
    /// When off, channels are only detached locally.
    pub leave_channels: bool,
    /// Capacity of the inbound command queue.
    pub command_capacity: usize,
    /// Capacity of the outbound notification queue.
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            leave_channels: true,
            command_capacity: 256,
            notification_capacity: 256,
        }
    }
}

/// One settings file as written: only the fields it names are `Some`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigOverlay {
    pub socket: SocketOverlay,
    pub session: SessionOverlay,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SocketOverlay {
    pub url: Option<String>,
    pub params: BTreeMap<String, String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionOverlay {
    pub leave_channels: Option<bool>,
    pub command_capacity: Option<usize>,
    pub notification_capacity: Option<usize>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = load_layers(global_config_path().as_deref(), project_dir)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Defaults, then the global file, then the project file. Missing files
/// are skipped.
pub fn load_layers(global_path: Option<&Path>, project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_path
        && global_path.exists()
    {
        debug!(path = %global_path.display(), "Loading global config");
        merge_config(&mut config, read_overlay(global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".chanmux").join("settings.json");
        if project_path.exists() {
            debug!(path = %project_path.display(), "Loading project config");
            merge_config(&mut config, read_overlay(&project_path)?);
        }
    }

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".chanmux").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/chanmux/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("chanmux").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read a single settings file on top of the built-in defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, read_overlay(path)?);
    Ok(config)
}

fn read_overlay(path: &Path) -> Result<ConfigOverlay> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigOverlay) {
    let ConfigOverlay {
        socket,
        session,
        log_level,
    } = overlay;

    if let Some(url) = socket.url {
        base.socket.url = url;
    }
    if let Some(secs) = socket.heartbeat_interval_secs {
        base.socket.heartbeat_interval_secs = secs;
    }
    if let Some(secs) = socket.connect_timeout_secs {
        base.socket.connect_timeout_secs = secs;
    }
    base.socket.params.extend(socket.params);

    if let Some(leave) = session.leave_channels {
        base.session.leave_channels = leave;
    }
    if let Some(capacity) = session.command_capacity {
        base.session.command_capacity = capacity;
    }
    if let Some(capacity) = session.notification_capacity {
        base.session.notification_capacity = capacity;
    }
    if let Some(level) = log_level {
        base.log_level = level;
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("CHANMUX_SOCKET_URL") {
        config.socket.url = val;
    }
    if let Ok(val) = std::env::var("CHANMUX_HEARTBEAT_INTERVAL")
        && let Ok(n) = val.parse()
    {
        config.socket.heartbeat_interval_secs = n;
    }
    if let Ok(val) = std::env::var("CHANMUX_LEAVE_CHANNELS")
        && let Ok(b) = val.parse()
    {
        config.session.leave_channels = b;
    }
    if let Ok(val) = std::env::var("CHANMUX_LOG_LEVEL") {
        config.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write_project_settings(dir: &Path, body: &str) {
        let cfg_dir = dir.join(".chanmux");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("settings.json"), body).unwrap();
    }

    #[test]
    fn default_config_targets_local_socket() {
        let config = Config::default();
        assert_eq!(config.socket.url, "ws://localhost:4000/socket");
        assert_eq!(config.socket.heartbeat_interval(), Duration::from_secs(30));
        assert!(config.session.leave_channels);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_project_settings(
            dir.path(),
            r#"{"socket": {"url": "wss://example.test/socket"}}"#,
        );

        let config = load_config_file(&dir.path().join(".chanmux/settings.json")).unwrap();
        assert_eq!(config.socket.url, "wss://example.test/socket");
        assert_eq!(config.socket.connect_timeout_secs, 10);
        assert_eq!(config.session.command_capacity, 256);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn merge_extends_connect_params() {
        let mut base = Config::default();
        base.socket.params.insert("token".into(), "a".into());
        let mut overlay = ConfigOverlay::default();
        overlay.socket.params.insert("player".into(), "p1".into());
        overlay.session.leave_channels = Some(false);

        merge_config(&mut base, overlay);

        assert_eq!(base.socket.params.len(), 2);
        assert!(!base.session.leave_channels);
        assert_eq!(base.session.command_capacity, 256);
    }

    #[test]
    fn project_file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        std::fs::write(
            &global,
            r#"{
                "socket": {"url": "wss://global.test/socket", "heartbeat_interval_secs": 5,
                           "params": {"token": "g"}},
                "session": {"leave_channels": false, "command_capacity": 8},
                "log_level": "debug"
            }"#,
        )
        .unwrap();
        let project = dir.path().join("project");
        write_project_settings(
            &project,
            r#"{"socket": {"connect_timeout_secs": 3, "params": {"player": "p1"}},
                "session": {"notification_capacity": 4}}"#,
        );

        let config = load_layers(Some(&global), Some(&project)).unwrap();
        assert_eq!(config.socket.url, "wss://global.test/socket");
        assert_eq!(config.socket.heartbeat_interval_secs, 5);
        assert_eq!(config.socket.connect_timeout_secs, 3);
        assert_eq!(config.socket.params.len(), 2);
        assert!(!config.session.leave_channels);
        assert_eq!(config.session.command_capacity, 8);
        assert_eq!(config.session.notification_capacity, 4);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn missing_layers_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_layers(Some(&dir.path().join("absent.json")), Some(dir.path())).unwrap();
        assert_eq!(config.socket.url, Config::default().socket.url);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        write_project_settings(dir.path(), "{ nope");

        let err = load_config_file(&dir.path().join(".chanmux/settings.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("settings.json"));
    }
}
