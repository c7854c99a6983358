//! # Common Adapter Infrastructure
//!
//! Shared trait definitions and utilities for all Vela provider adapters:
//! the [`OhlcvSource`] capability, environment-based credentials, and the
//! normalization pipeline every adapter funnels its raw rows through.

use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use types::{validate_bars, BarBatch, BarRow, Timeframe};

// ============================================================================
// CORE TRAIT
// ============================================================================

/// Capability every batch data source implements: fetch canonical OHLCV
/// bars for one symbol over an inclusive UTC range.
///
/// Contract:
/// - Returned rows are in strict ascending time order, deduplicated by
///   timestamp, already normalized and validated.
/// - An empty-but-valid window returns an empty batch, not an error.
/// - Unknown timeframes fail with `InvalidRequest` before any request is
///   sent; unknown symbols fail with `SymbolNotFound`.
/// - `fetch_ohlcv` is idempotent and safe to wrap in the retry executor.
#[async_trait]
pub trait OhlcvSource: Send + Sync {
    /// Stable provider name, used in cache keys, catalog provenance, and
    /// error attribution.
    fn name(&self) -> &str;

    /// Deterministic digest of provider-specific configuration (exchange
    /// id, tier, CSV directory). Folded into cache keys so differently
    /// configured sources never share an entry.
    fn provider_config(&self) -> String;

    /// Source URL recorded in provenance rows.
    fn source_url(&self) -> String;

    /// API version recorded in provenance rows, when the provider has one.
    fn api_version(&self) -> Option<String> {
        None
    }

    /// Fetch bars for `symbol` over `[start, end]` at `timeframe`.
    ///
    /// The returned rows carry `sid = 0`; sids are bundle-local and are
    /// assigned by the orchestrator at cataloging time.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarBatch>;
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

/// API credentials resolved from `<PREFIX>_API_KEY` / `<PREFIX>_API_SECRET`.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: Option<String>,
}

impl ApiCredentials {
    /// Load credentials from the environment. A missing key is fatal at
    /// adapter construction.
    pub fn from_env(provider: &str, prefix: &str) -> Result<Self> {
        let key_var = format!("{prefix}_API_KEY");
        let api_key = std::env::var(&key_var).map_err(|_| AdapterError::Auth {
            provider: provider.to_string(),
            detail: format!("environment variable {key_var} is not set"),
        })?;
        let api_secret = std::env::var(format!("{prefix}_API_SECRET")).ok();
        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Assemble raw provider rows into a canonical batch: sort, deduplicate by
/// `(sid, ts)`, and validate the OHLCV invariants. Pure function of its
/// input - repeated calls produce identical batches.
pub fn normalize_rows(provider: &str, rows: Vec<BarRow>) -> Result<BarBatch> {
    let raw_count = rows.len();
    let batch = BarBatch::from_rows(rows);
    if batch.len() < raw_count {
        debug!(
            provider,
            dropped = raw_count - batch.len(),
            "duplicate_rows_deduplicated"
        );
    }
    validate_bars(&batch)?;
    Ok(batch)
}

/// Resolve a canonical timeframe label through an adapter's mapping table,
/// failing with `InvalidRequest` when the provider cannot express it.
pub fn map_timeframe<'a>(
    provider: &str,
    timeframe: Timeframe,
    table: &'a [(Timeframe, &'a str)],
) -> Result<&'a str> {
    table
        .iter()
        .find(|(tf, _)| *tf == timeframe)
        .map(|(_, label)| *label)
        .ok_or_else(|| {
            AdapterError::InvalidRequest(format!(
                "provider {provider} does not support timeframe {timeframe}"
            ))
        })
}

// ============================================================================
// WIRE HELPERS
// ============================================================================

/// Map an HTTP error status onto the adapter taxonomy. `404` handling is
/// provider-specific (often "no such symbol") and stays with the caller.
pub fn classify_status(provider: &str, status: reqwest::StatusCode) -> Option<AdapterError> {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Some(AdapterError::Auth {
            provider: provider.to_string(),
            detail: format!("provider returned {status}"),
        });
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Some(AdapterError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        });
    }
    if status.is_server_error() {
        return Some(AdapterError::Network {
            provider: provider.to_string(),
            reason: format!("provider returned {status}"),
        });
    }
    None
}

/// Map a reqwest transport failure to `Network`.
pub fn transport_error(provider: &str, err: reqwest::Error) -> AdapterError {
    AdapterError::Network {
        provider: provider.to_string(),
        reason: err.to_string(),
    }
}

/// Extract the wire text of a JSON number or string without routing the
/// value through binary floating point. Relies on serde_json's
/// arbitrary-precision numbers, which keep the source literal.
pub fn wire_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
