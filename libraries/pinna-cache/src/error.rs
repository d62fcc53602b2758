//! Error types for cache managers.

use std::sync::Arc;
use thiserror::Error;

/// Errors a cache manager can report.
///
/// Cloneable so a deterministic failure can be replayed on every access.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Stored state does not match what the manifest promised
    #[error("Corrupt cache entry for {identifier}: {reason}")]
    Corrupt { identifier: String, reason: String },

    /// Manifest could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single payload larger than the whole cache
    #[error("Payload for {identifier} is {size} bytes, over the {limit} byte cache limit")]
    TooLarge {
        identifier: String,
        size: u64,
        limit: u64,
    },

    /// Identifiers with the reserved prefix belong to the cache manager
    #[error("Identifier {0} uses the reserved prefix")]
    ReservedIdentifier(String),

    /// Failure configured on a test cache manager
    #[error("{0}")]
    Injected(String),
}

impl CacheError {
    pub fn corrupt(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    pub fn injected(message: impl Into<String>) -> Self {
        Self::Injected(message.into())
    }

    /// The request-level error for a failed read of `identifier`.
    pub fn into_load_error(self, identifier: &str) -> pinna_core::Error {
        pinna_core::Error::CannotLoadCache {
            identifier: identifier.to_string(),
            message: self.to_string(),
        }
    }

    /// The request-level error for a failed write of `identifier`.
    pub fn into_write_error(self, identifier: &str) -> pinna_core::Error {
        pinna_core::Error::CannotWriteCache {
            identifier: identifier.to_string(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
