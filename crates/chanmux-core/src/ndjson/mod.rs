//! NDJSON boundary between the application and the bridge.
//!
//! The application writes one [`Command`] per line and reads one
//! [`Notification`] per line. Parsing is strict about the `type` tag and
//! tolerant of blank lines.

mod parser;
mod types;

pub use parser::{encode_line, parse_command, parse_notification};
pub use types::*;
