//! Heartbeat-derived health.
//!
//! Pure function of `(now, last_heartbeat, interval)` so it can be tested
//! without sockets or timers. An account is unhealthy iff
//! `now - last > 2 * interval + buffer`, where the buffer tolerates a
//! heartbeat that is in flight while the monitor ticks.

/// Deltas beyond this (or negative ones) are treated as clock skew.
pub const MAX_PLAUSIBLE_DELTA_SECS: f64 = 86_400.0;

/// Upper bound on the grace buffer.
pub const MAX_GRACE_BUFFER_SECS: f64 = 2.0;

/// Outcome of a health evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthVerdict {
    /// Last heartbeat is recent enough.
    Healthy,
    /// No heartbeat within the threshold.
    Unhealthy {
        /// Seconds since the last heartbeat.
        elapsed: f64,
        /// The threshold that was exceeded.
        threshold: f64,
    },
    /// The delta is implausible; the caller should reset the timestamp.
    ClockSkew {
        /// The rejected delta in seconds.
        delta: f64,
    },
}

/// Grace buffer for a given interval: `min(0.5 * interval, 2s)`.
pub fn grace_buffer(interval: f64) -> f64 {
    (0.5 * interval).clamp(0.0, MAX_GRACE_BUFFER_SECS)
}

/// Silence allowed before an account is unhealthy.
pub fn health_threshold(interval: f64) -> f64 {
    2.0 * interval + grace_buffer(interval)
}

/// Evaluate health from the last heartbeat timestamp.
pub fn evaluate_health(now: f64, last_heartbeat: f64, interval: f64) -> HealthVerdict {
    let delta = now - last_heartbeat;
    if !delta.is_finite() || !(0.0..=MAX_PLAUSIBLE_DELTA_SECS).contains(&delta) {
        return HealthVerdict::ClockSkew { delta };
    }
    let threshold = health_threshold(interval);
    if delta > threshold {
        HealthVerdict::Unhealthy {
            elapsed: delta,
            threshold,
        }
    } else {
        HealthVerdict::Healthy
    }
}
