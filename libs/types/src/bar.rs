//! Canonical bar row and batch types.
//!
//! A bar is one time bucket of open/high/low/close/volume for one asset at
//! one resolution. Prices and volumes are exact decimals at [`PRICE_SCALE`];
//! timestamps are UTC instants with microsecond precision (daily bars carry
//! midnight UTC and persist as calendar dates).

use chrono::{DateTime, Utc};
use rust_decimal::prelude::RoundingStrategy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Decimal precision of every price/volume column: `decimal(18, 8)`.
pub const PRICE_PRECISION: u8 = 18;

/// Decimal scale of every price/volume column.
pub const PRICE_SCALE: u32 = 8;

/// Bundle-local dense asset identifier.
pub type Sid = i64;

/// Error converting a provider wire value into a canonical decimal.
#[derive(Debug, Error)]
pub enum WireDecimalError {
    #[error("invalid decimal value '{value}': {reason}")]
    Invalid { value: String, reason: String },

    #[error("value '{value}' exceeds decimal({precision}, {scale}) bounds")]
    OutOfRange {
        value: String,
        precision: u8,
        scale: u32,
    },
}

/// Parse a wire string into a canonical scale-8 decimal.
///
/// This is the only sanctioned path from provider data to a stored price:
/// the string representation is parsed directly, so the value never passes
/// through binary floating point. Values with more than 8 fractional digits
/// are rounded half-to-even; values wider than `decimal(18, 8)` are rejected.
pub fn decimal_from_wire(value: &str) -> Result<Decimal, WireDecimalError> {
    let trimmed = value.trim();
    let parsed = Decimal::from_str(trimmed).map_err(|e| WireDecimalError::Invalid {
        value: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    let mut normalized = parsed;
    if normalized.scale() > PRICE_SCALE {
        normalized =
            normalized.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointNearestEven);
    }
    normalized.rescale(PRICE_SCALE);

    // decimal(18, 8) admits 10 integral digits.
    let integral_limit = Decimal::from(10_000_000_000u64);
    if normalized.abs() >= integral_limit {
        return Err(WireDecimalError::OutOfRange {
            value: trimmed.to_string(),
            precision: PRICE_PRECISION,
            scale: PRICE_SCALE,
        });
    }

    Ok(normalized)
}

/// A single canonical OHLCV bar. Immutable once written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarRow {
    /// Bar instant, UTC. Midnight for daily bars.
    pub ts: DateTime<Utc>,
    /// Bundle-local asset id.
    pub sid: Sid,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl BarRow {
    /// Value of the given OHLCV field.
    pub fn field(&self, field: BarField) -> Decimal {
        match field {
            BarField::Open => self.open,
            BarField::High => self.high,
            BarField::Low => self.low,
            BarField::Close => self.close,
            BarField::Volume => self.volume,
        }
    }

    /// Whether this row satisfies the OHLCV invariants.
    pub fn is_coherent(&self) -> bool {
        self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
            && self.open.min(self.high).min(self.low).min(self.close) >= Decimal::ZERO
            && self.volume >= Decimal::ZERO
    }
}

/// The five queryable bar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl BarField {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarField::Open => "open",
            BarField::High => "high",
            BarField::Low => "low",
            BarField::Close => "close",
            BarField::Volume => "volume",
        }
    }
}

impl fmt::Display for BarField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BarField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BarField::Open),
            "high" => Ok(BarField::High),
            "low" => Ok(BarField::Low),
            "close" => Ok(BarField::Close),
            "volume" => Ok(BarField::Volume),
            other => Err(format!("unknown bar field '{other}'")),
        }
    }
}

/// An ordered, deduplicated collection of bar rows.
///
/// Construction sorts by `(sid, ts)` and drops duplicate `(sid, ts)` pairs,
/// keeping the first occurrence, so per symbol the time values are strictly
/// increasing - the ordering guarantee every downstream consumer relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarBatch {
    rows: Vec<BarRow>,
}

impl BarBatch {
    /// Build a batch from raw rows, normalizing order and dropping
    /// duplicate `(sid, ts)` entries.
    pub fn from_rows(mut rows: Vec<BarRow>) -> Self {
        rows.sort_by(|a, b| a.sid.cmp(&b.sid).then(a.ts.cmp(&b.ts)));
        rows.dedup_by(|next, prev| next.sid == prev.sid && next.ts == prev.ts);
        Self { rows }
    }

    /// An empty batch.
    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn rows(&self) -> &[BarRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<BarRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BarRow> {
        self.rows.iter()
    }

    /// Inclusive `(min, max)` timestamp range, or `None` when empty.
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let min = self.rows.iter().map(|r| r.ts).min()?;
        let max = self.rows.iter().map(|r| r.ts).max()?;
        Some((min, max))
    }

    /// Distinct sids present, ascending.
    pub fn sids(&self) -> Vec<Sid> {
        let mut sids: Vec<Sid> = self.rows.iter().map(|r| r.sid).collect();
        sids.sort_unstable();
        sids.dedup();
        sids
    }

    /// Merge two batches into one normalized batch.
    pub fn merge(self, other: BarBatch) -> BarBatch {
        let mut rows = self.rows;
        rows.extend(other.rows);
        BarBatch::from_rows(rows)
    }
}

impl IntoIterator for BarBatch {
    type Item = BarRow;
    type IntoIter = std::vec::IntoIter<BarRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
