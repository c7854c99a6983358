//! Error types for the bar store.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure while writing or scanning partitions
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path the operation was touching
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Parquet encode/decode failure
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow array construction failure
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// File schema does not match the canonical bar schema
    #[error("schema mismatch in {path}: {detail}")]
    SchemaMismatch {
        /// Offending file
        path: PathBuf,
        /// What differed
        detail: String,
    },

    /// Batch failed OHLCV validation; nothing was written
    #[error(transparent)]
    InvalidBatch(#[from] types::ValidationError),

    /// Decimal value outside the canonical decimal(18, 8) envelope
    #[error("decimal out of range: {0}")]
    DecimalOutOfRange(String),

    /// Timestamp outside the representable microsecond range
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
