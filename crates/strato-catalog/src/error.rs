//! Catalog error types.

use thiserror::Error;

use strato_common::StratoError;

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Errors from catalog replay and persistence.
///
/// Filename-level parse failures are deliberately absent: an unparseable
/// filename is not an error, the file drops into the `others` bucket for
/// later deletion.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A checkpoint or block payload could not be decoded.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the malformed payload.
        message: String,
    },

    /// A referenced table has no checkpoint on disk.
    #[error("no checkpoint on disk for table {table_id}")]
    MissingCheckpoint {
        /// The table id.
        table_id: u64,
    },
}

impl CatalogError {
    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<bincode::Error> for CatalogError {
    fn from(e: bincode::Error) -> Self {
        Self::decode(e.to_string())
    }
}

impl From<CatalogError> for StratoError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Io { source } => StratoError::Io { source },
            CatalogError::Decode { message } => StratoError::parse(message),
            CatalogError::MissingCheckpoint { table_id } => {
                StratoError::execution(format!("no checkpoint on disk for table {}", table_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: StratoError = CatalogError::decode("bad payload").into();
        assert!(matches!(err, StratoError::Parse { .. }));
    }
}
