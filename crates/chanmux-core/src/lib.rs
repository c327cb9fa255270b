//! `chanmux` Core Library
//!
//! Shared functionality for `chanmux` components:
//! - Application command/notification types and their NDJSON line codec
//! - Routing error taxonomy surfaced to the application
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use ndjson::{Command, Notification, PushId, RouteError};
