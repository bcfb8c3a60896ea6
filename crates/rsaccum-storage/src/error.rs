//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No buffered data for the namespace. Distinct from backend failures so
    /// a flush that lost the race can treat it as a no-op.
    #[error("no buffered data for userNs: {user_ns}")]
    BufferNotFound { user_ns: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Backend connection error.
    #[error("backend connection error: {message}")]
    ConnectionError { message: String },

    /// Backend operation error.
    #[error("backend operation error: {message}")]
    OperationError { message: String },

    /// Serialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl StorageError {
    /// Whether this error is the distinct not-found raised by `fetch`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::BufferNotFound { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
