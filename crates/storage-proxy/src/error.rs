//! Error taxonomy for storage operations.
//!
//! A missing key is not an error: lookups return `Ok(None)`. Everything else
//! that can go wrong is one of the variants below, and each variant's message
//! is meant to be shown to the person operating the proxy.

use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Unknown mode or a credential/field the requested mode needs is missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend could not be reached while initializing or probing.
    #[error("Connection failed: {0}")]
    Connectivity(String),

    /// Access token is confirmed expired and could not be refreshed.
    #[error("{0}")]
    AuthExpired(String),

    /// Rate limiting or upstream 5xx that outlived the retry budget.
    #[error("Temporary remote failure: {0}")]
    AuthTransient(String),

    /// Remote app lacks a required scope.
    #[error("{0}")]
    Permission(String),

    /// Local disk failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key cannot be mapped onto a file or object name.
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored bytes could not be decompressed.
    #[error("Decompression error: {0}")]
    Codec(String),

    /// Unclassified failure reported by a remote backend.
    #[error("{backend} error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
}

impl StorageError {
    pub(crate) fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        StorageError::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Whether the caller supplied something unusable (as opposed to a
    /// failure on the storage side).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            StorageError::Config(_) | StorageError::InvalidKey { .. }
        )
    }
}
