//! Wall-clock helpers.
//!
//! Heartbeat timestamps are kept as unix seconds (`f64`) rather than
//! `Instant` because the health check has to tolerate wall-clock jumps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in fractional unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
