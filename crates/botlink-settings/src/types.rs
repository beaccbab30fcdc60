//! Settings schema.
//!
//! Every section implements `Default`; the loader serializes the defaults,
//! deep-merges the user file over them and deserializes the result, so a
//! settings file only needs the keys it changes.

use std::time::Duration;

use botlink_core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default heartbeat interval assumed until an upstream announces one.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: f64 = 30.0;

/// Top-level settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    /// Upstream accounts, in configuration order.
    pub accounts: Vec<AccountSpec>,
    /// Connection manager tuning.
    pub upstream: UpstreamSettings,
    /// Child program discovery and supervision.
    pub children: ChildrenSettings,
    /// Local forwarding proxy timings.
    pub proxy: ProxySettings,
    /// Ephemeral port range for proxies.
    pub ports: PortSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl BotSettings {
    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.ports.range_start == 0 || self.ports.range_start > self.ports.range_end {
            return Err(SettingsError::InvalidValue(format!(
                "port range {}..={} is empty",
                self.ports.range_start, self.ports.range_end
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for (idx, account) in self.accounts.iter().enumerate() {
            if account.endpoint_uri.trim().is_empty() {
                return Err(SettingsError::InvalidValue(format!(
                    "accounts[{idx}].endpoint_uri is empty"
                )));
            }
            if let Some(id) = account.id {
                if !seen.insert(id) {
                    return Err(SettingsError::InvalidValue(format!(
                        "duplicate account id {id}"
                    )));
                }
            }
        }

        for (name, value) in [
            ("upstream.monitor_interval_secs", self.upstream.monitor_interval_secs),
            ("upstream.connect_timeout_secs", self.upstream.connect_timeout_secs),
            ("children.monitor_interval_secs", self.children.monitor_interval_secs),
            ("proxy.ping_interval_secs", self.proxy.ping_interval_secs),
            ("proxy.idle_check_interval_secs", self.proxy.idle_check_interval_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accounts
// ─────────────────────────────────────────────────────────────────────────────

/// One configured upstream account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSpec {
    /// External account id; a synthetic one is assigned when absent.
    #[serde(default)]
    pub id: Option<i64>,
    /// Election priority, lower is preferred.
    #[serde(default)]
    pub priority: i32,
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:3001`.
    pub endpoint_uri: String,
    /// Bearer token sent in the `Authorization` header.
    #[serde(default)]
    pub auth_token: String,
    /// Per-account connection overrides.
    #[serde(default)]
    pub connection: Option<ConnectionOverrides>,
}

/// Optional per-account overrides of heartbeat and retry behaviour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionOverrides {
    /// Expected heartbeat interval in seconds.
    #[serde(default)]
    pub heartbeat_interval: Option<f64>,
    /// Retries before going silent.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Base reconnect delay in seconds.
    #[serde(default)]
    pub retry_delay_base: Option<f64>,
    /// Reconnect delay cap in seconds.
    #[serde(default)]
    pub retry_delay_max: Option<f64>,
    /// Backoff multiplier.
    #[serde(default)]
    pub retry_backoff_factor: Option<f64>,
}

impl AccountSpec {
    /// Initial heartbeat interval in seconds.
    pub fn heartbeat_interval(&self) -> f64 {
        self.connection
            .as_ref()
            .and_then(|c| c.heartbeat_interval)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS)
    }

    /// Effective retry policy (defaults plus overrides).
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(c) = &self.connection {
            if let Some(v) = c.max_retries {
                policy.max_retries = v;
            }
            if let Some(v) = c.retry_delay_base {
                policy.base_delay_secs = v;
            }
            if let Some(v) = c.retry_delay_max {
                policy.max_delay_secs = v;
            }
            if let Some(v) = c.retry_backoff_factor {
                policy.backoff_factor = v;
            }
        }
        policy
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream
// ─────────────────────────────────────────────────────────────────────────────

/// Connection manager tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Seconds between health-monitor ticks.
    pub monitor_interval_secs: f64,
    /// Seconds allowed for a single connect attempt.
    pub connect_timeout_secs: f64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 5.0,
            connect_timeout_secs: 10.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Children
// ─────────────────────────────────────────────────────────────────────────────

/// Child program discovery and supervision.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildrenSettings {
    /// Directory scanned for child subdirectories.
    pub dir: String,
    /// Interpreter placed before the entry point (e.g. `python3`). When
    /// unset the entry point is executed directly.
    pub runtime: Option<String>,
    /// Version children are checked against; defaults to this build's.
    pub manager_version: Option<String>,
    /// Seconds between process liveness polls.
    pub monitor_interval_secs: f64,
    /// Cap on automatic restarts per child; unset means unbounded.
    pub max_restarts: Option<u32>,
    /// Launch `startup = true` children after discovery.
    pub autostart: bool,
}

impl Default for ChildrenSettings {
    fn default() -> Self {
        Self {
            dir: "subbots".into(),
            runtime: None,
            manager_version: None,
            monitor_interval_secs: 10.0,
            max_restarts: None,
            autostart: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

/// Local forwarding proxy timings, all in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Interval between transport-level pings.
    pub ping_interval_secs: f64,
    /// How long a ping may go unanswered.
    pub pong_timeout_secs: f64,
    /// Deadline for the first (auth) frame.
    pub auth_timeout_secs: f64,
    /// Drop a child connection silent for longer than this.
    pub idle_timeout_secs: f64,
    /// Tick of the application-level heartbeat monitor.
    pub idle_check_interval_secs: f64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 25.0,
            pong_timeout_secs: 20.0,
            auth_timeout_secs: 10.0,
            idle_timeout_secs: 45.0,
            idle_check_interval_secs: 10.0,
        }
    }
}

impl ProxySettings {
    /// Ping interval as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        secs(self.ping_interval_secs)
    }
    /// Pong timeout as a `Duration`.
    pub fn pong_timeout(&self) -> Duration {
        secs(self.pong_timeout_secs)
    }
    /// Auth deadline as a `Duration`.
    pub fn auth_timeout(&self) -> Duration {
        secs(self.auth_timeout_secs)
    }
    /// Idle cutoff as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle_timeout_secs)
    }
    /// Idle monitor tick as a `Duration`.
    pub fn idle_check_interval(&self) -> Duration {
        secs(self.idle_check_interval_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ports / logging
// ─────────────────────────────────────────────────────────────────────────────

/// Ephemeral port range handed to proxies.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// First port of the range (inclusive).
    pub range_start: u16,
    /// Last port of the range (inclusive).
    pub range_end: u16,
    /// Random picks before falling back to a linear scan.
    pub random_attempts: u32,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            range_start: 30_000,
            range_end: 39_999,
            random_attempts: 100,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Convert fractional seconds to a `Duration`, clamping invalid input to zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn account(uri: &str) -> AccountSpec {
        AccountSpec {
            id: None,
            priority: 0,
            endpoint_uri: uri.into(),
            auth_token: String::new(),
            connection: None,
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = BotSettings::default();
        assert!(s.accounts.is_empty());
        assert!((s.upstream.monitor_interval_secs - 5.0).abs() < f64::EPSILON);
        assert!((s.children.monitor_interval_secs - 10.0).abs() < f64::EPSILON);
        assert!(s.children.max_restarts.is_none());
        assert_eq!(s.proxy.ping_interval(), Duration::from_secs(25));
        assert_eq!(s.proxy.pong_timeout(), Duration::from_secs(20));
        assert_eq!(s.proxy.auth_timeout(), Duration::from_secs(10));
        assert_eq!(s.proxy.idle_timeout(), Duration::from_secs(45));
        assert_eq!(s.proxy.idle_check_interval(), Duration::from_secs(10));
        assert_eq!(s.ports.random_attempts, 100);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn account_spec_minimal_json() {
        let a: AccountSpec =
            serde_json::from_str(r#"{"endpoint_uri":"ws://127.0.0.1:3001"}"#).unwrap();
        assert_eq!(a.id, None);
        assert_eq!(a.priority, 0);
        assert!((a.heartbeat_interval() - DEFAULT_HEARTBEAT_INTERVAL_SECS).abs() < f64::EPSILON);
        assert_eq!(a.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn account_overrides_apply() {
        let a: AccountSpec = serde_json::from_str(
            r#"{
                "id": 7, "priority": 2, "endpoint_uri": "ws://x", "auth_token": "t",
                "connection": {
                    "heartbeat_interval": 5,
                    "max_retries": 3,
                    "retry_delay_base": 0.5,
                    "retry_delay_max": 20,
                    "retry_backoff_factor": 1.5
                }
            }"#,
        )
        .unwrap();
        assert!((a.heartbeat_interval() - 5.0).abs() < f64::EPSILON);
        let p = a.retry_policy();
        assert_eq!(p.max_retries, 3);
        assert!((p.base_delay_secs - 0.5).abs() < f64::EPSILON);
        assert!((p.max_delay_secs - 20.0).abs() < f64::EPSILON);
        assert!((p.backoff_factor - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn nonpositive_heartbeat_override_is_ignored() {
        let mut a = account("ws://x");
        a.connection = Some(ConnectionOverrides {
            heartbeat_interval: Some(0.0),
            ..ConnectionOverrides::default()
        });
        assert!((a.heartbeat_interval() - DEFAULT_HEARTBEAT_INTERVAL_SECS).abs() < f64::EPSILON);
    }

    #[test]
    fn validate_rejects_empty_port_range() {
        let mut s = BotSettings::default();
        s.ports.range_start = 40_000;
        s.ports.range_end = 30_000;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut s = BotSettings::default();
        let mut a = account("ws://a");
        a.id = Some(1);
        let mut b = account("ws://b");
        b.id = Some(1);
        s.accounts = vec![a, b];
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate account id 1"));
    }

    #[test]
    fn validate_rejects_blank_endpoint() {
        let mut s = BotSettings::default();
        s.accounts = vec![account("  ")];
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut s = BotSettings::default();
        s.upstream.monitor_interval_secs = 0.0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn secs_clamps_invalid() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.25), Duration::from_millis(250));
    }
}
