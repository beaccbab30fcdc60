//! # botlink-upstream
//!
//! Holds one WebSocket client connection per configured upstream account
//! and keeps exactly one of them published as *active*.
//!
//! - [`account`]: per-account state (connected, healthy, retry budget)
//! - [`health`]: heartbeat freshness as a pure function
//! - [`election`]: priority-ordered choice of the active account
//! - [`manager`]: [`ConnectionManager`], the monitor loop and the
//!   active-changed callback
//! - `session`: the per-account connect/pump/backoff loop

#![deny(unsafe_code)]

pub mod account;
pub mod election;
pub mod errors;
pub mod health;
pub mod manager;
mod session;

pub use account::{AccountConnection, AccountId, AccountStatus};
pub use election::ElectionDecision;
pub use errors::{Result, UpstreamError};
pub use manager::{ActiveChangedCallback, ConnectionManager, FrameHandler};
pub use session::OUTBOUND_QUEUE_CAPACITY;
