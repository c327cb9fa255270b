//! Channel session multiplexing.
//!
//! One [`SessionMultiplexer`] per transport connection. It owns the channel
//! registry, the event listener table and the pending-push table, and runs
//! the single dispatch loop that serializes application commands with
//! transport replies and events.

mod listeners;
mod multiplexer;
mod registry;
mod router;
mod types;

pub use listeners::ListenerTable;
pub use multiplexer::{SessionHandle, SessionMultiplexer};
pub use registry::{ChannelEntry, ChannelRegistry, OpenOutcome};
pub use router::{CommandRouter, PendingPush, RouteContext};
pub use types::{ChannelState, MultiplexerConfig, MultiplexerStats, SessionEnd};
