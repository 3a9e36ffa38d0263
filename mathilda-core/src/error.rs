//! Error types for Mathilda cache operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a key-value backend.
///
/// These never reach application code: the cache client logs them and
/// serves the call from the in-process fallback store instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Connection to {backend} failed: {reason}")]
    Connection { backend: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} failed: {reason}")]
    Command { operation: String, reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Key {key} holds a value of the wrong type for {operation}")]
    WrongType { key: String, operation: String },

    #[error("Backend {backend} is not available")]
    Unavailable { backend: String },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

impl CacheError {
    /// Whether this error means the connection itself is gone (as opposed
    /// to a single command being rejected).
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Mathilda errors.
#[derive(Debug, Clone, Error)]
pub enum MathildaError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry error: {reason}")]
    Telemetry { reason: String },
}

/// Result type alias for backend operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for Mathilda operations.
pub type MathildaResult<T> = Result<T, MathildaError>;

// =============================================================================
// TESTS
// =============================================================================
