//! Error types for building network collaborators.
//!
//! Failures of an individual request travel through its promise as a
//! [`pinna_core::Error`]; this module covers everything that can go wrong
//! before a request exists.

use thiserror::Error;

/// Errors raised while configuring the request pipeline.
#[derive(Error, Debug)]
pub enum NetError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Request body could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache could not be opened
    #[error("Cache error: {0}")]
    Cache(#[from] pinna_cache::CacheError),

    /// Queue could not be started
    #[error("Queue error: {0}")]
    Queue(#[from] pinna_core::Error),
}

impl From<url::ParseError> for NetError {
    fn from(error: url::ParseError) -> Self {
        Self::InvalidUrl(error.to_string())
    }
}

impl From<config::ConfigError> for NetError {
    fn from(error: config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Result type for configuration and construction
pub type Result<T> = std::result::Result<T, NetError>;
