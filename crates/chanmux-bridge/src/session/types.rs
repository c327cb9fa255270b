//! Session multiplexer types.

use chanmux_core::config::SessionConfig;

/// Lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Joining,
    Joined,
    JoinFailed,
    Left,
}

/// Configuration for the session multiplexer.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Call transport leave on explicit leave and on teardown.
    pub leave_channels: bool,
    /// Command queue capacity used by [`super::SessionMultiplexer::start`].
    pub command_capacity: usize,
    /// Notification queue capacity used by [`super::SessionMultiplexer::start`].
    pub notification_capacity: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for MultiplexerConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            leave_channels: config.leave_channels,
            command_capacity: config.command_capacity.max(1),
            notification_capacity: config.notification_capacity.max(1),
        }
    }
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Registry entries, in any state.
    pub channel_count: usize,
    /// Entries in [`ChannelState::Joined`].
    pub joined_count: usize,
    /// Active event listeners.
    pub subscription_count: usize,
    /// Pushes awaiting their reply.
    pub pending_pushes: usize,
}

/// Why a session's dispatch loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The application closed its command stream.
    CommandsClosed,
    /// The application stopped reading notifications.
    NotificationsClosed,
    /// The transport disconnected.
    Disconnected { reason: String },
}
