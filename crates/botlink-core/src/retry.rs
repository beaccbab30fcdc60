//! Reconnect policy and backoff calculation.
//!
//! The async reconnect loop lives in `botlink-upstream`; this module holds
//! the portable building blocks:
//!
//! - [`RetryPolicy`]: per-account retry parameters
//! - [`backoff_delay`]: capped exponential backoff
//! - [`RetryPolicy::schedule`]: decide the next delay and whether the
//!   account has gone silent

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default number of retries before an account goes silent.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Default base delay in seconds.
pub const DEFAULT_BASE_DELAY_SECS: f64 = 1.0;
/// Default maximum delay in seconds.
pub const DEFAULT_MAX_DELAY_SECS: f64 = 60.0;
/// Default growth factor per retry.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Retry parameters for one upstream account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries before switching to silent mode (default: 10).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in seconds (default: 1.0).
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,
    /// Delay cap in seconds, also the silent-mode interval (default: 60.0).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// Multiplier applied per retry (default: 2.0).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay() -> f64 {
    DEFAULT_BASE_DELAY_SECS
}
fn default_max_delay() -> f64 {
    DEFAULT_MAX_DELAY_SECS
}
fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_secs: DEFAULT_BASE_DELAY_SECS,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// What the reconnect loop should do after a failed attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySchedule {
    /// How long to wait before the next attempt.
    pub delay: Duration,
    /// Whether per-attempt logging should be suppressed.
    pub silent: bool,
}

impl RetryPolicy {
    /// Compute the schedule for the given (already incremented) retry count.
    ///
    /// Once `retry_count` exceeds `max_retries` the account is silent and
    /// retries at `max_delay` forever.
    pub fn schedule(&self, retry_count: u32) -> RetrySchedule {
        if retry_count > self.max_retries {
            return RetrySchedule {
                delay: secs(self.max_delay_secs),
                silent: true,
            };
        }
        RetrySchedule {
            delay: backoff_delay(
                retry_count,
                self.base_delay_secs,
                self.backoff_factor,
                self.max_delay_secs,
            ),
            silent: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Capped exponential backoff.
///
/// Formula: `min(max_delay, base_delay * backoff_factor^retry_count)`
///
/// Non-finite or negative intermediate values collapse to `max_delay`
/// (or zero when the cap itself is invalid).
pub fn backoff_delay(retry_count: u32, base_delay: f64, backoff_factor: f64, max_delay: f64) -> Duration {
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let raw = base_delay * backoff_factor.powi(exponent);
    let capped = if raw.is_finite() { raw.min(max_delay) } else { max_delay };
    secs(capped)
}

fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
