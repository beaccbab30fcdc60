//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while decoding wire frames or version expressions.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON or did not match the expected shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    /// A version string contained a non-numeric component.
    #[error("invalid version `{0}`")]
    InvalidVersion(String),
    /// A compatibility range did not start with a known comparator.
    #[error("invalid version range `{0}`")]
    InvalidRange(String),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;
