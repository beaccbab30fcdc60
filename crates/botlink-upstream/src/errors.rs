//! Upstream connection errors.

use thiserror::Error;

use crate::account::AccountId;

/// Errors raised by the connection manager.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The configured endpoint could not be turned into a WebSocket request.
    #[error("invalid endpoint `{uri}`: {message}")]
    InvalidEndpoint {
        /// The offending URI.
        uri: String,
        /// Why it was rejected.
        message: String,
    },
    /// The connect attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    /// Transport-level WebSocket failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// No account is currently active.
    #[error("no active upstream account")]
    NoActiveAccount,
    /// The account has no open socket.
    #[error("account {0} is not connected")]
    NotConnected(AccountId),
    /// The account's outbound queue is full.
    #[error("outbound queue for account {0} is full")]
    QueueFull(AccountId),
}

/// Result type for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;
