//! Wire-protocol frames.
//!
//! Frames are JSON text messages over WebSocket:
//!
//! - request: `{action, params, echo}`
//! - response: `{status, retcode, data, echo}`
//! - heartbeat meta event: `{post_type: "meta_event", meta_event_type:
//!   "heartbeat", self_id, status: {good, online}, interval}`
//!
//! Only the pieces the supervision layer inspects are modelled; everything
//! else is relayed as opaque text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Action name of the child authentication handshake.
pub const AUTH_ACTION: &str = "auth";

/// Retcode returned for a successful request.
pub const RETCODE_OK: i64 = 0;

/// Retcode returned when a child presents a bad token.
pub const RETCODE_UNAUTHORIZED: i64 = 401;

/// A request frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    /// Action name (e.g. `"send_msg"`, `"auth"`).
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: Value,
    /// Opaque correlation value echoed back in the response.
    #[serde(default)]
    pub echo: Value,
}

impl WireRequest {
    /// Parse a request from raw frame text.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// The access token carried by an `auth` request, if this is one.
    pub fn access_token(&self) -> Option<&str> {
        if self.action != AUTH_ACTION {
            return None;
        }
        self.params.get("access_token").and_then(Value::as_str)
    }
}

/// Response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The request succeeded.
    Ok,
    /// The request failed; see `retcode`.
    Failed,
}

/// A response frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    /// Outcome.
    pub status: ResponseStatus,
    /// Numeric result code (`0` on success).
    pub retcode: i64,
    /// Payload, `null` when there is none.
    #[serde(default)]
    pub data: Value,
    /// Correlation value copied from the request.
    #[serde(default)]
    pub echo: Value,
}

impl WireResponse {
    /// Successful response with no payload.
    pub fn ok(echo: Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            retcode: RETCODE_OK,
            data: Value::Null,
            echo,
        }
    }

    /// Failed response with the given retcode.
    pub fn failed(retcode: i64, echo: Value) -> Self {
        Self {
            status: ResponseStatus::Failed,
            retcode,
            data: Value::Null,
            echo,
        }
    }

    /// Serialize to frame text.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize response frame");
            String::new()
        })
    }
}

/// A heartbeat meta event reported by an upstream account.
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatEvent {
    /// Account id the heartbeat belongs to, when the frame carries one.
    pub self_id: Option<i64>,
    /// `status.good` from the frame.
    pub good: bool,
    /// `status.online` from the frame.
    pub online: bool,
    /// Heartbeat interval announced by the upstream, in milliseconds.
    pub interval_ms: Option<f64>,
}

impl HeartbeatEvent {
    /// Extract a heartbeat from a decoded frame.
    ///
    /// Returns `None` for anything that is not a heartbeat meta event.
    /// Missing `status` flags are treated as `false`.
    pub fn from_frame(frame: &Value) -> Option<Self> {
        let is_meta = frame.get("post_type").and_then(Value::as_str) == Some("meta_event");
        let is_heartbeat =
            frame.get("meta_event_type").and_then(Value::as_str) == Some("heartbeat");
        if !(is_meta && is_heartbeat) {
            return None;
        }

        let status = frame.get("status");
        let flag = |key: &str| {
            status
                .and_then(|s| s.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        let self_id = frame.get("self_id").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });

        Some(Self {
            self_id,
            good: flag("good"),
            online: flag("online"),
            interval_ms: frame.get("interval").and_then(Value::as_f64),
        })
    }

    /// Parse raw frame text and extract a heartbeat.
    pub fn from_text(text: &str) -> Option<Self> {
        let frame: Value = serde_json::from_str(text).ok()?;
        Self::from_frame(&frame)
    }
}
