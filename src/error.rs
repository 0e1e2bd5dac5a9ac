//! Error types for the Tollgate service.

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A backing store operation failed while a decision was being made.
    ///
    /// The verdict for the request is undetermined; callers must not treat
    /// this as either an allow or a deny.
    #[error("Storage error while trying to {operation}: {source}")]
    Storage {
        /// The engine step that failed
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Wrap a storage failure with the name of the step that produced it.
    pub fn storage(operation: &'static str, source: StorageError) -> Self {
        TollgateError::Storage { operation, source }
    }

    /// Returns `true` if this error came from the backing store.
    pub fn is_storage(&self) -> bool {
        matches!(self, TollgateError::Storage { .. })
    }
}

impl From<::config::ConfigError> for TollgateError {
    fn from(err: ::config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
