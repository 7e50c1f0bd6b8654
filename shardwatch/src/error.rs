//! Error types for shardwatch.

use thiserror::Error;

/// Errors reported by a [`CoordinationClient`](crate::CoordinationClient).
///
/// These never reach callers of the lookup API; the availability client logs
/// them and degrades to "no answer now". Only explicit writes through the
/// [`AvailabilityPublisher`](crate::AvailabilityPublisher) surface them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The node at `path` does not exist.
    #[error("node does not exist: {path}")]
    NoNode {
        /// Path that was addressed.
        path: String,
    },

    /// A node already exists at `path`.
    #[error("node already exists: {path}")]
    NodeExists {
        /// Path that was addressed.
        path: String,
    },

    /// The session is not connected right now.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The session was expired by the coordination service.
    #[error("coordination session expired")]
    SessionExpired,

    /// The service rejected the supplied credentials.
    #[error("authentication failed")]
    AuthFailed,

    /// The handle was closed and cannot be used anymore.
    #[error("coordination client is closed")]
    Closed,

    /// Any other backend failure.
    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Whether this error means the addressed node is gone.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode { .. })
    }
}

/// Result type for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors raised while loading or validating an [`HaConfig`](crate::HaConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No coordination servers were configured.
    #[error("no coordination servers configured")]
    MissingServers,

    /// A path option is not an absolute, normalized path.
    #[error("invalid {field}: {path:?} (expected an absolute path without trailing '/')")]
    InvalidPath {
        /// Name of the offending option.
        field: &'static str,
        /// The rejected value.
        path: String,
    },

    /// The connect timeout is zero.
    #[error("connect timeout must be greater than zero")]
    ZeroConnectTimeout,

    /// The reconnect base interval is zero.
    #[error("reconnect base interval must be greater than zero")]
    ZeroReconnectInterval,

    /// The configuration document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by [`AvailabilityPublisher`](crate::AvailabilityPublisher) writes.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The coordination service rejected the operation.
    #[error("coordination error: {0}")]
    Coordination(#[from] CoordinationError),

    /// The value could not be encoded as JSON.
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("failed to decode {path}: {source}")]
    Decode {
        /// Path whose payload was rejected.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Result type for publisher operations.
pub type PublishResult<T> = Result<T, PublishError>;
