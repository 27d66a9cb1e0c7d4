//! Error kinds shared by the cache tiers, the coordinator and the middleware
//! pipeline.
//!
//! Validation problems stay local to the caller; tier I/O failures feed the
//! coordinator's failover accounting and only reach the caller when every
//! tier failed; serialization failures are a miss on reads and a hard error
//! on writes.

use thiserror::Error;

/// Error raised by cache tiers and the coordinator.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Malformed key (empty namespace or key) or bad pattern.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport or disk failure during a tier operation.
    #[error("tier i/o failure: {0}")]
    Io(String),

    /// Encode/decode failure for a stored value.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// `increment` was called on a value that does not hold a number.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A tier operation exceeded its configured timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Every registered tier is unhealthy or the coordinator has no tiers.
    #[error("no healthy cache tier available")]
    NoHealthyTier,

    /// The coordinator or tier is shutting down; new operations fail fast.
    #[error("shutdown in progress")]
    ShuttingDown,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
