//! Error types for ingestion jobs.
//!
//! Every user-visible failure carries the bundle name, the affected symbol
//! when one can be blamed, and the requested range, so a failed job can be
//! attributed without digging through logs.

use adapter_service::AdapterError;
use catalog::CatalogError;
use chrono::{DateTime, Utc};
use store::StoreError;
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for ingestion jobs.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Adapter failure attributed to one symbol (or the whole job when
    /// `symbol` is `None`)
    #[error("ingest of bundle '{bundle}' failed for {symbol:?} over {start}..{end}: {source}")]
    Fetch {
        bundle: String,
        symbol: Option<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        #[source]
        source: AdapterError,
    },

    /// Every requested symbol failed; nothing was written
    #[error("ingest of bundle '{bundle}' failed for all {count} symbols")]
    AllSymbolsFailed {
        bundle: String,
        count: usize,
        /// (symbol, error) pairs for attribution
        failures: Vec<(String, String)>,
    },

    /// Columnar store failure during the writing stage
    #[error("write failed for bundle '{bundle}': {source}")]
    Store {
        bundle: String,
        #[source]
        source: StoreError,
    },

    /// Catalog failure during lookup or the cataloging stage; an unknown
    /// bundle surfaces as `CatalogError::BundleNotFound` inside this
    #[error("catalog operation failed for bundle '{bundle}': {source}")]
    Catalog {
        bundle: String,
        #[source]
        source: CatalogError,
    },

    /// Malformed CLI argument (frequency, symbol list, size)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
