//! `chanmux` bridge
//!
//! Multiplexes channel sessions over one socket connection: the
//! application issues join/push/subscribe/unsubscribe/leave commands and
//! receives correlated notifications back.

pub mod session;
pub mod stdio;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
