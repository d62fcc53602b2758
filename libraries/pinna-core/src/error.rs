//! Error types carried through promises and possibilities

use thiserror::Error;

/// Result type alias using `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection could not be established
    Connect,
    /// The transport gave up waiting
    Timeout,
    /// The response could not be read
    Malformed,
    /// Anything else reported by the transport
    Other,
}

/// Error delivered to promise continuations.
///
/// The type is `Clone` because a realized promise hands the same error to
/// every continuation registered on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request was cancelled before it produced a result
    #[error("Request cancelled")]
    Cancelled,

    /// The remote revision matched the cached revision
    #[error("Remote data unchanged for {identifier}")]
    Unchanged { identifier: String },

    /// The cache manager failed while it was authoritative for a request
    #[error("Cannot load cache for {identifier}: {message}")]
    CannotLoadCache { identifier: String, message: String },

    /// The cache manager could not persist a response
    #[error("Cannot write cache for {identifier}: {message}")]
    CannotWriteCache { identifier: String, message: String },

    /// Connection failure, timeout or malformed response
    #[error("Transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        identifier: Option<String>,
    },

    /// The server answered with a non-success status
    #[error("Server responded with status {status}")]
    Status {
        status: u16,
        identifier: Option<String>,
    },

    /// The preflight transform rejected the request
    #[error("Preflight failed: {0}")]
    Preflight(String),

    /// A post-processor could not decode the payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// The post-processor produced nothing
    #[error("No value produced")]
    NoValue,

    /// A URL could not be built
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A work queue could not run the job
    #[error("Queue error: {0}")]
    Queue(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
            identifier: None,
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create an other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this error means "stopped on purpose" rather than "failed".
    ///
    /// Both explicit cancellation and the unchanged-since-cache sentinel
    /// count as cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Unchanged { .. })
    }

    /// The cache identifier this error was annotated with, if any.
    pub fn cache_identifier(&self) -> Option<&str> {
        match self {
            Self::Unchanged { identifier }
            | Self::CannotLoadCache { identifier, .. }
            | Self::CannotWriteCache { identifier, .. } => Some(identifier),
            Self::Transport { identifier, .. } | Self::Status { identifier, .. } => {
                identifier.as_deref()
            }
            _ => None,
        }
    }

    /// Annotate transport and status errors with the affected cache identifier.
    ///
    /// Errors that already carry an identifier, or that never carry one, are
    /// returned unchanged.
    pub fn with_cache_identifier(self, cache_identifier: Option<&str>) -> Self {
        let Some(cache_identifier) = cache_identifier else {
            return self;
        };
        match self {
            Self::Transport {
                kind,
                message,
                identifier: None,
            } => Self::Transport {
                kind,
                message,
                identifier: Some(cache_identifier.to_string()),
            },
            Self::Status {
                status,
                identifier: None,
            } => Self::Status {
                status,
                identifier: Some(cache_identifier.to_string()),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_classification() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::Unchanged {
            identifier: "x".into()
        }
        .is_cancellation());
        assert!(!Error::NoValue.is_cancellation());
        assert!(!Error::transport(TransportErrorKind::Timeout, "slow").is_cancellation());
    }

    #[test]
    fn test_transport_annotation() {
        let error = Error::transport(TransportErrorKind::Connect, "refused")
            .with_cache_identifier(Some("songs"));
        assert_eq!(error.cache_identifier(), Some("songs"));

        // An existing annotation wins
        let error = error.with_cache_identifier(Some("other"));
        assert_eq!(error.cache_identifier(), Some("songs"));
    }

    #[test]
    fn test_annotation_ignores_unrelated_errors() {
        let error = Error::NoValue.with_cache_identifier(Some("songs"));
        assert_eq!(error, Error::NoValue);
        assert_eq!(error.cache_identifier(), None);
    }
}
