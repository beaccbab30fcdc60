//! Per-account connection state.
//!
//! Each configured account owns one [`AccountConnection`]. Its mutable state
//! lives behind a `parking_lot::Mutex` that is only ever held for short,
//! non-async critical sections.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use botlink_core::retry::{RetryPolicy, RetrySchedule};
use botlink_settings::AccountSpec;

use crate::errors::{Result, UpstreamError};
use crate::health::{HealthVerdict, evaluate_health};

/// Numeric account identifier.
pub type AccountId = i64;

/// Mutable per-account bookkeeping.
#[derive(Debug)]
struct AccountState {
    outbound: Option<mpsc::Sender<String>>,
    connected: bool,
    healthy: bool,
    last_heartbeat: f64,
    heartbeat_interval: f64,
    retry_count: u32,
    silent: bool,
}

/// Snapshot of an account, safe to hand out and serialize.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccountStatus {
    /// Account id.
    pub id: AccountId,
    /// Lower is preferred.
    pub priority: i32,
    /// Upstream endpoint.
    pub endpoint_uri: String,
    /// Socket is open.
    pub connected: bool,
    /// Heartbeats are fresh and report good/online.
    pub healthy: bool,
    /// Wall-clock seconds of the last heartbeat.
    pub last_heartbeat: f64,
    /// Current expected heartbeat interval in seconds.
    pub heartbeat_interval: f64,
    /// Consecutive failed connect attempts.
    pub retry_count: u32,
    /// Retry budget exhausted; per-attempt logging suppressed.
    pub silent: bool,
}

impl AccountStatus {
    /// Eligible to be the active account.
    pub fn is_available(&self) -> bool {
        self.connected && self.healthy
    }
}

/// What changed when a health evaluation was applied.
#[derive(Clone, Debug, PartialEq)]
pub enum HealthTransition {
    /// Nothing changed.
    Unchanged,
    /// The account went from healthy to unhealthy.
    BecameUnhealthy {
        /// Seconds since the last heartbeat.
        elapsed: f64,
    },
    /// The heartbeat timestamp was reset because of clock skew.
    SkewReset {
        /// The rejected delta.
        delta: f64,
    },
}

/// One upstream account and its live connection state.
#[derive(Debug)]
pub struct AccountConnection {
    id: AccountId,
    priority: i32,
    endpoint_uri: String,
    auth_token: String,
    policy: RetryPolicy,
    state: Mutex<AccountState>,
}

impl AccountConnection {
    /// Build from a configured account. `now` seeds the heartbeat timestamp.
    pub fn new(id: AccountId, spec: &AccountSpec, now: f64) -> Self {
        Self {
            id,
            priority: spec.priority,
            endpoint_uri: spec.endpoint_uri.clone(),
            auth_token: spec.auth_token.clone(),
            policy: spec.retry_policy(),
            state: Mutex::new(AccountState {
                outbound: None,
                connected: false,
                healthy: false,
                last_heartbeat: now,
                heartbeat_interval: spec.heartbeat_interval(),
                retry_count: 0,
                silent: false,
            }),
        }
    }

    /// Account id.
    pub fn id(&self) -> AccountId {
        self.id
    }

    /// Election priority; lower wins.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Upstream endpoint URI.
    pub fn endpoint_uri(&self) -> &str {
        &self.endpoint_uri
    }

    /// Bearer token; empty means no `Authorization` header.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Reconnect policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Take a snapshot of the current state.
    pub fn status(&self) -> AccountStatus {
        let state = self.state.lock();
        AccountStatus {
            id: self.id,
            priority: self.priority,
            endpoint_uri: self.endpoint_uri.clone(),
            connected: state.connected,
            healthy: state.healthy,
            last_heartbeat: state.last_heartbeat,
            heartbeat_interval: state.heartbeat_interval,
            retry_count: state.retry_count,
            silent: state.silent,
        }
    }

    /// Connected and healthy.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock();
        state.connected && state.healthy
    }

    /// Whether reconnect logging is currently suppressed.
    pub fn is_silent(&self) -> bool {
        self.state.lock().silent
    }

    /// Record a successful connect.
    ///
    /// Resets the retry budget and treats the connect itself as a fresh
    /// heartbeat. Returns `true` if the account had been silently retrying.
    pub fn mark_connected(&self, outbound: mpsc::Sender<String>, now: f64) -> bool {
        let mut state = self.state.lock();
        let was_silent = state.silent;
        state.outbound = Some(outbound);
        state.connected = true;
        state.healthy = true;
        state.last_heartbeat = now;
        state.retry_count = 0;
        state.silent = false;
        was_silent
    }

    /// Record a lost or failed connection and compute the next backoff.
    ///
    /// Returns the schedule and whether this call is the one that exhausted
    /// the retry budget.
    pub fn mark_disconnected(&self) -> (RetrySchedule, bool) {
        let mut state = self.state.lock();
        state.outbound = None;
        state.connected = false;
        state.healthy = false;
        state.retry_count = state.retry_count.saturating_add(1);
        let schedule = self.policy.schedule(state.retry_count);
        let entered_silent = schedule.silent && !state.silent;
        state.silent = schedule.silent;
        (schedule, entered_silent)
    }

    /// Drop the outbound handle without touching retry bookkeeping.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.outbound = None;
        state.connected = false;
        state.healthy = false;
    }

    /// Apply a heartbeat report.
    ///
    /// `interval_secs`, when present and positive, replaces the expected
    /// interval. Returns `true` if the account went from unhealthy to healthy.
    pub fn record_heartbeat(
        &self,
        now: f64,
        good: bool,
        online: bool,
        interval_secs: Option<f64>,
    ) -> bool {
        let mut state = self.state.lock();
        let was_healthy = state.healthy;
        state.last_heartbeat = now;
        state.healthy = good && online;
        if let Some(interval) = interval_secs.filter(|v| v.is_finite() && *v > 0.0) {
            state.heartbeat_interval = interval;
        }
        !was_healthy && state.healthy
    }

    /// Re-evaluate heartbeat freshness.
    ///
    /// Only connected accounts are evaluated. A stale heartbeat clears the
    /// healthy flag; clock skew resets the timestamp and leaves the flag
    /// alone.
    pub fn apply_health(&self, now: f64) -> HealthTransition {
        let mut state = self.state.lock();
        if !state.connected {
            return HealthTransition::Unchanged;
        }
        match evaluate_health(now, state.last_heartbeat, state.heartbeat_interval) {
            HealthVerdict::Healthy => HealthTransition::Unchanged,
            HealthVerdict::Unhealthy { elapsed, .. } => {
                if state.healthy {
                    state.healthy = false;
                    HealthTransition::BecameUnhealthy { elapsed }
                } else {
                    HealthTransition::Unchanged
                }
            }
            HealthVerdict::ClockSkew { delta } => {
                state.last_heartbeat = now;
                HealthTransition::SkewReset { delta }
            }
        }
    }

    /// Queue a frame for this account's socket writer.
    pub fn send(&self, frame: String) -> Result<()> {
        let outbound = self
            .state
            .lock()
            .outbound
            .clone()
            .ok_or(UpstreamError::NotConnected(self.id))?;
        outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => UpstreamError::QueueFull(self.id),
            TrySendError::Closed(_) => UpstreamError::NotConnected(self.id),
        })
    }
}
