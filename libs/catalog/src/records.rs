//! Narrow record structs for every catalog table.
//!
//! Each table gets one explicit struct with a documented field set; there is
//! no dynamic field bag anywhere in the catalog API.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use types::{AssetKind, QualityReport, Sid};

/// Provenance of one bundle: where the data came from and how it was
/// fetched. One row per bundle, upserted on every ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_type: String,
    pub source_url: Option<String>,
    pub api_version: Option<String>,
    /// When the provider was queried, UTC epoch seconds.
    pub fetch_timestamp: i64,
    pub data_version: Option<String>,
    /// Hex SHA-256 over the canonical written content.
    pub checksum: String,
    /// Timezone of the source data before normalization.
    pub timezone: String,
}

/// One validation pass over a bundle. Append-only; the latest row by
/// `validation_timestamp` is the authoritative view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quality {
    pub row_count: i64,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub missing_days_count: i64,
    pub missing_days: Vec<NaiveDate>,
    pub outlier_count: i64,
    pub ohlcv_violations: i64,
    /// UTC epoch seconds of the validation pass.
    pub validation_timestamp: i64,
    pub validation_passed: bool,
}

impl Quality {
    /// Build a catalog record from a validation sweep.
    pub fn from_report(report: &QualityReport, validation_timestamp: i64) -> Self {
        Self {
            row_count: report.total_rows as i64,
            start_date: report.start_date,
            end_date: report.end_date,
            missing_days_count: report.missing_days.len() as i64,
            missing_days: report.missing_days.clone(),
            outlier_count: report.outlier_count as i64,
            ohlcv_violations: report.ohlcv_violations as i64,
            validation_timestamp,
            validation_passed: report.passed,
        }
    }
}

/// One symbol tracked under a bundle. The row id doubles as the
/// bundle-local sid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub sid: Sid,
    pub bundle_name: String,
    pub symbol: String,
    pub asset_kind: AssetKind,
    pub exchange: Option<String>,
}

/// One reusable fetch result bound to on-disk bar files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub bundle_name: String,
    pub bundle_path: String,
    pub fetch_timestamp: i64,
    pub size_bytes: i64,
    pub last_accessed: i64,
}

/// Daily cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub stat_date: NaiveDate,
    pub hit_count: i64,
    pub miss_count: i64,
    pub total_size_bytes: i64,
    pub avg_fetch_latency_ms: f64,
}

/// Merged bundle view: provenance plus the latest quality record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    pub bundle_name: String,
    pub provenance: Provenance,
    pub created_at: i64,
    pub updated_at: i64,
    pub quality: Option<Quality>,
}
