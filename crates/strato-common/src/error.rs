//! Error handling for StratoDB.
//!
//! This module provides the unified error type used across the execution
//! and storage components. Crate-local error types (buffer, catalog)
//! convert into [`StratoError`] at their boundaries.

use thiserror::Error;

/// Result type alias for StratoDB operations.
pub type StratoResult<T> = std::result::Result<T, StratoError>;

/// The unified error type for StratoDB.
#[derive(Debug, Error)]
pub enum StratoError {
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A persisted payload could not be decoded.
    ///
    /// Note that filename-level parse failures are not errors; unparseable
    /// filenames are retained for later deletion instead.
    #[error("parse error: {message}")]
    Parse {
        /// Description of the malformed payload.
        message: String,
    },

    /// Malformed plan or operator argument.
    #[error("plan error: {message}")]
    Plan {
        /// Description of the planning failure.
        message: String,
    },

    /// Operator runtime failure, including allocation failure.
    #[error("execution error: {message}")]
    Execution {
        /// Description of the runtime failure.
        message: String,
    },

    /// Operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// Operation not supported at this layer.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl StratoError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a plan error.
    #[must_use]
    pub fn plan(message: impl Into<String>) -> Self {
        Self::Plan {
            message: message.into(),
        }
    }

    /// Creates an execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a not-supported error.
    #[must_use]
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StratoError::plan("unexpected argument");
        assert_eq!(err.to_string(), "plan error: unexpected argument");

        let err = StratoError::Cancelled;
        assert_eq!(err.to_string(), "operation was cancelled");
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StratoError = io_err.into();
        assert!(matches!(err, StratoError::Io { .. }));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(StratoError::Cancelled.is_cancelled());
        assert!(!StratoError::execution("boom").is_cancelled());
    }
}
