//! Child supervision and proxy errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a [`ForwardingProxy`](crate::proxy::ForwardingProxy).
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The loopback listener could not be bound.
    #[error("failed to bind proxy on 127.0.0.1:{port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// `start` was called twice.
    #[error("proxy on port {0} already started")]
    AlreadyStarted(u16),
}

/// Errors from the child process manager.
#[derive(Debug, Error)]
pub enum ChildError {
    /// No declaration was discovered under this name.
    #[error("unknown child `{0}`")]
    NotFound(String),
    /// A live process already exists for this name.
    #[error("child `{0}` is already running")]
    AlreadyRunning(String),
    /// No live process exists for this name.
    #[error("child `{0}` is not running")]
    NotRunning(String),
    /// The configured port range has no free port left.
    #[error("no free port in the configured range")]
    PortsExhausted,
    /// The declaration file is missing or invalid.
    #[error("invalid declaration in {path}: {message}")]
    InvalidDeclaration {
        /// File that was read.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },
    /// The child process could not be spawned.
    #[error("failed to spawn child `{name}`: {source}")]
    Spawn {
        /// Child name.
        name: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The child's proxy failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    /// Filesystem error while scanning children.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for child operations.
pub type Result<T> = std::result::Result<T, ChildError>;
