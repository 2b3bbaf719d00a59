//! Error types for the cache engine
//!
//! Two families live here. [`CacheError`] covers everything that can go wrong
//! inside the cache tiers (storage I/O, undecodable envelopes, oversized items,
//! schema drift); these are logged and absorbed, never handed to a `fetch` caller.
//! [`RemoteError`] is the failure reported by the remote collaborator and is the
//! only error `fetch` ever returns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal error type for cache tier operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// A durable envelope or value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The durable substrate failed to read, write or delete
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Underlying filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An item was too large to be persisted
    #[error("Item `{key}` rejected: {size_bytes} bytes exceeds the {limit_bytes} byte item limit")]
    CapacityRejection {
        key: String,
        size_bytes: usize,
        limit_bytes: usize,
    },

    /// The stored schema version differs from the expected one
    #[error("Schema version mismatch: found {found:?}, expected {expected}")]
    VersionMismatch {
        found: Option<String>,
        expected: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

/// Failure reported by the remote collaborator
///
/// `Clone` because a single failure is delivered to every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The handler ran and rejected the call
    #[error("Remote call `{operation}` failed: {message}")]
    Failed {
        operation: String,
        code: Option<String>,
        message: String,
    },

    /// No handler is registered under this name
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Arguments could not be decoded into the handler's argument type
    #[error("Invalid arguments for `{operation}`: {message}")]
    InvalidArguments { operation: String, message: String },

    /// The task driving the call died before producing a result
    #[error("Remote call `{operation}` interrupted: {message}")]
    Interrupted { operation: String, message: String },
}

impl RemoteError {
    /// Build a plain handler failure
    pub fn failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Failed {
            operation: operation.into(),
            code: None,
            message: message.into(),
        }
    }

    /// Build a handler failure carrying an application error code
    pub fn with_code(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        RemoteError::Failed {
            operation: operation.into(),
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Application error code, if the handler supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Failed { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
