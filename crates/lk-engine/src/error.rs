//! Error types for the ListKeeper engine
//!
//! Network errors carry whether the attempt may be retried. Everything else
//! is either fatal to `Engine::start` or reported back to the caller of a
//! registry operation.

use std::path::PathBuf;

use lk_compiler::CompileError;
use lk_core::RecordError;
use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure while fetching a subscription
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Filesystem failure
    #[error("Storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    /// Unreadable subscription record
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Aggregate could not be written
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Catalog could not be parsed
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Unknown subscription
    #[error("Subscription not found: {0}")]
    NotFound(String),

    /// Built-in, catalog and local subscriptions cannot be removed
    #[error("Subscription cannot be removed: {0}")]
    NotRemovable(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection could not be established
    Connect,
    /// Request or body read timed out
    Timeout,
    /// Response body could not be decoded
    Body,
    /// Other transport error
    Other,
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Connect | NetworkErrorKind::Timeout | NetworkErrorKind::Body
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            NetworkErrorKind::Body
        } else {
            NetworkErrorKind::Other
        };
        Self::network(kind, err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_retryable() {
        assert!(EngineError::network(NetworkErrorKind::Timeout, "slow").is_retryable());
        assert!(EngineError::network(NetworkErrorKind::Connect, "refused").is_retryable());
        assert!(!EngineError::network(NetworkErrorKind::Other, "redirect loop").is_retryable());
    }

    #[test]
    fn test_other_errors_not_retryable() {
        assert!(!EngineError::NotFound("url:https://x/".to_string()).is_retryable());
        assert!(!EngineError::storage("/tmp/x", "denied").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = EngineError::invalid_input("url", "not a url");
        assert_eq!(err.to_string(), "Invalid input for 'url': not a url");
    }
}
