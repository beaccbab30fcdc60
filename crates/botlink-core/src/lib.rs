//! # botlink-core
//!
//! Foundation types shared by every botlink crate:
//!
//! - [`protocol`]: wire-protocol frames (requests, responses, heartbeat events)
//! - [`retry`]: capped exponential backoff for upstream reconnects
//! - [`version`]: dotted version comparison and compatibility ranges
//! - [`logging`]: `tracing` subscriber setup
//! - [`clock`]: wall-clock helpers used by heartbeat bookkeeping

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod version;

pub use errors::{ProtocolError, Result};
