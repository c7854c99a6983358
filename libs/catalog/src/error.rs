//! Error types for catalog operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Main error type for catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Transactional SQLite failure
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure (migration backup, cache file removal)
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path the operation was touching
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Bundle is not present in the catalog
    #[error("bundle '{bundle}' not found in catalog")]
    BundleNotFound {
        /// The missing bundle name
        bundle: String,
    },

    /// Legacy-catalog migration failure
    #[error("catalog migration failed: {0}")]
    Migration(String),

    /// Manifest or missing-days serialization failure
    #[error("catalog serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CatalogError::Io {
            path: path.into(),
            source,
        }
    }
}
