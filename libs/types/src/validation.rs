//! OHLCV data-quality validation.
//!
//! Invariants checked on every batch before it may be written:
//! `high >= max(open, close)`, `low <= min(open, close)`, `high >= low`,
//! all prices non-negative, volume non-negative. Comparisons are exact
//! decimal comparisons. A violating batch is rejected whole; there are no
//! partial writes.

use crate::bar::{BarBatch, BarRow};
use crate::timeframe::Timeframe;
use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Raised when a batch breaks the OHLCV invariants.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("ohlcv invariants violated in {count} of {total} rows; first offender: {sample}")]
    OhlcvViolations {
        count: usize,
        total: usize,
        sample: String,
    },
}

fn describe(row: &BarRow) -> String {
    format!(
        "sid={} ts={} o={} h={} l={} c={} v={}",
        row.sid, row.ts, row.open, row.high, row.low, row.close, row.volume
    )
}

/// Validate every row of a batch, failing with a count and a sample row on
/// the first scan. An empty batch is trivially valid.
pub fn validate_bars(batch: &BarBatch) -> Result<(), ValidationError> {
    let violations: Vec<&BarRow> = batch.iter().filter(|r| !r.is_coherent()).collect();
    if let Some(first) = violations.first() {
        return Err(ValidationError::OhlcvViolations {
            count: violations.len(),
            total: batch.len(),
            sample: describe(first),
        });
    }
    Ok(())
}

/// Count rows breaking the invariants without failing.
pub fn count_violations(batch: &BarBatch) -> usize {
    batch.iter().filter(|r| !r.is_coherent()).count()
}

/// Calendar days in `[start, end]` with no rows at all.
///
/// Daily granularity regardless of resolution; weekends and holidays show up
/// here for equities, which is expected and recorded, not an error.
pub fn missing_days(batch: &BarBatch, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut covered: Vec<NaiveDate> = batch.iter().map(|r| r.ts.date_naive()).collect();
    covered.sort_unstable();
    covered.dedup();

    let mut missing = Vec::new();
    let mut day = start;
    while day <= end {
        if covered.binary_search(&day).is_err() {
            missing.push(day);
        }
        day += Duration::days(1);
    }
    missing
}

/// Count close prices more than `threshold_std` standard deviations from the
/// batch mean. Statistics only - the f64 cast here never feeds back into
/// stored data.
pub fn detect_close_outliers(batch: &BarBatch, threshold_std: f64) -> usize {
    if batch.len() < 2 {
        return 0;
    }

    let closes: Vec<f64> = batch
        .iter()
        .filter_map(|r| r.close.to_f64())
        .collect();
    if closes.len() < 2 {
        return 0;
    }

    let mean = closes.iter().sum::<f64>() / closes.len() as f64;
    let variance =
        closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (closes.len() - 1) as f64;
    let std = variance.sqrt();
    if std == 0.0 || !std.is_finite() {
        return 0;
    }

    let outliers = closes
        .iter()
        .filter(|c| (*c - mean).abs() > threshold_std * std)
        .count();
    if outliers > 0 {
        warn!(
            outlier_count = outliers,
            total_rows = batch.len(),
            threshold_std,
            "close_price_outliers_detected"
        );
    }
    outliers
}

/// Summary of a validation pass over one batch, persisted as a quality
/// record by the cataloging stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_rows: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub missing_days: Vec<NaiveDate>,
    pub outlier_count: usize,
    pub ohlcv_violations: usize,
    pub passed: bool,
}

/// Run the full quality sweep over a batch.
pub fn quality_report(batch: &BarBatch, timeframe: Timeframe) -> QualityReport {
    let violations = count_violations(batch);
    let (start_date, end_date) = match batch.time_range() {
        Some((start, end)) => (Some(start.date_naive()), Some(end.date_naive())),
        None => (None, None),
    };

    // Gap scan only makes sense against a continuous daily axis; intraday
    // batches are scanned at the same day granularity.
    let missing = match (start_date, end_date) {
        (Some(s), Some(e)) => missing_days(batch, s, e),
        _ => Vec::new(),
    };
    let _ = timeframe;

    QualityReport {
        total_rows: batch.len(),
        start_date,
        end_date,
        missing_days: missing,
        outlier_count: detect_close_outliers(batch, 3.0),
        ohlcv_violations: violations,
        passed: violations == 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::BarRow;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn row(day: u32, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> BarRow {
        BarRow {
            ts: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
            sid: 1,
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn valid_batch_passes() {
        let batch = BarBatch::from_rows(vec![row(1, dec!(100), dec!(105), dec!(95), dec!(102))]);
        assert!(validate_bars(&batch).is_ok());
    }

    #[test]
    fn high_below_low_is_rejected_with_sample() {
        let batch = BarBatch::from_rows(vec![
            row(1, dec!(100), dec!(105), dec!(95), dec!(102)),
            row(2, dec!(100), dec!(90), dec!(95), dec!(92)),
        ]);
        let err = validate_bars(&batch).unwrap_err();
        match err {
            ValidationError::OhlcvViolations { count, total, sample } => {
                assert_eq!(count, 1);
                assert_eq!(total, 2);
                assert!(sample.contains("sid=1"));
            }
        }
    }

    #[test]
    fn negative_price_is_a_violation() {
        let batch = BarBatch::from_rows(vec![row(1, dec!(-1), dec!(5), dec!(-2), dec!(3))]);
        assert_eq!(count_violations(&batch), 1);
    }

    #[test]
    fn missing_days_enumerates_gaps() {
        let batch = BarBatch::from_rows(vec![
            row(1, dec!(1), dec!(1), dec!(1), dec!(1)),
            row(3, dec!(1), dec!(1), dec!(1), dec!(1)),
        ]);
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 1, 4).unwrap();
        assert_eq!(
            missing_days(&batch, start, end),
            vec![
                NaiveDate::from_ymd_opt(2023, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2023, 1, 4).unwrap(),
            ]
        );
    }

    #[test]
    fn outlier_detection_flags_spikes() {
        let mut rows: Vec<BarRow> = (1..=20)
            .map(|d| row(d, dec!(100), dec!(101), dec!(99), dec!(100)))
            .collect();
        rows.push(row(21, dec!(100), dec!(10000), dec!(99), dec!(10000)));
        let batch = BarBatch::from_rows(rows);
        assert!(detect_close_outliers(&batch, 3.0) >= 1);
    }

    #[test]
    fn quality_report_rolls_everything_up() {
        let batch = BarBatch::from_rows(vec![
            row(1, dec!(100), dec!(105), dec!(95), dec!(102)),
            row(2, dec!(100), dec!(90), dec!(95), dec!(92)),
        ]);
        let report = quality_report(&batch, Timeframe::D1);
        assert_eq!(report.total_rows, 2);
        assert_eq!(report.ohlcv_violations, 1);
        assert!(!report.passed);
        assert_eq!(
            report.start_date,
            Some(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap())
        );
    }
}
