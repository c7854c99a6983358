//! CSV filesystem adapter.
//!
//! Reads `<dir>/<SYMBOL>.csv` files with a header row naming at least
//! `open`, `high`, `low`, `close`, `volume` and a `date` or `timestamp`
//! column. No credentials, no rate limiting - just local files normalized
//! through the same pipeline as every network adapter.

use crate::common::{normalize_rows, OhlcvSource};
use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;
use types::{decimal_from_wire, BarBatch, BarRow, Timeframe};

pub struct CsvDirAdapter {
    name: String,
    csv_dir: PathBuf,
}

impl CsvDirAdapter {
    /// Build an adapter over a directory of per-symbol CSV files. The
    /// directory must exist.
    pub fn new(csv_dir: impl Into<PathBuf>) -> Result<Self> {
        let csv_dir = csv_dir.into();
        if !csv_dir.is_dir() {
            return Err(AdapterError::InvalidRequest(format!(
                "csv directory {} does not exist",
                csv_dir.display()
            )));
        }
        Ok(Self {
            name: "csvdir".to_string(),
            csv_dir,
        })
    }

    /// `BTC/USDT` is stored as `BTC-USDT.csv`; path separators never reach
    /// the filesystem.
    fn file_for(&self, symbol: &str) -> PathBuf {
        self.csv_dir.join(format!("{}.csv", symbol.replace('/', "-")))
    }

    fn parse_error(&self, path: &Path, detail: &str) -> AdapterError {
        AdapterError::Parse {
            provider: self.name.clone(),
            detail: format!("{}: {detail}", path.display()),
        }
    }
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[async_trait]
impl OhlcvSource for CsvDirAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_config(&self) -> String {
        format!("csv_dir={}", self.csv_dir.display())
    }

    fn source_url(&self) -> String {
        format!("file://{}", self.csv_dir.display())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _timeframe: Timeframe,
    ) -> Result<BarBatch> {
        let path = self.file_for(symbol);
        if !path.is_file() {
            return Err(AdapterError::SymbolNotFound {
                provider: self.name.clone(),
                symbol: symbol.to_string(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&path)
            .map_err(|e| self.parse_error(&path, &format!("unreadable file: {e}")))?;

        let headers = reader
            .headers()
            .map_err(|e| self.parse_error(&path, &format!("unreadable header: {e}")))?
            .clone();
        let column = |names: &[&str]| -> Option<usize> {
            headers
                .iter()
                .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
        };
        let time_col = column(&["date", "timestamp", "time"])
            .ok_or_else(|| self.parse_error(&path, "no date/timestamp column"))?;
        let ohlcv_cols: Vec<usize> = ["open", "high", "low", "close", "volume"]
            .iter()
            .map(|name| {
                column(&[name])
                    .ok_or_else(|| self.parse_error(&path, &format!("no '{name}' column")))
            })
            .collect::<Result<_>>()?;

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record =
                record.map_err(|e| self.parse_error(&path, &format!("row {}: {e}", index + 2)))?;
            let raw_ts = record
                .get(time_col)
                .ok_or_else(|| self.parse_error(&path, &format!("row {}: short row", index + 2)))?;
            let ts = parse_instant(raw_ts).ok_or_else(|| {
                self.parse_error(&path, &format!("row {}: bad timestamp '{raw_ts}'", index + 2))
            })?;
            if ts < start || ts > end {
                continue;
            }

            let mut values = [rust_decimal::Decimal::ZERO; 5];
            for (slot, col) in values.iter_mut().zip(&ohlcv_cols) {
                let raw = record.get(*col).ok_or_else(|| {
                    self.parse_error(&path, &format!("row {}: short row", index + 2))
                })?;
                *slot = decimal_from_wire(raw).map_err(|e| {
                    self.parse_error(&path, &format!("row {}: {e}", index + 2))
                })?;
            }

            rows.push(BarRow {
                ts,
                sid: 0,
                open: values[0],
                high: values[1],
                low: values[2],
                close: values[3],
                volume: values[4],
            });
        }

        debug!(
            provider = %self.name,
            symbol,
            path = %path.display(),
            rows = rows.len(),
            "ohlcv_fetched"
        );
        normalize_rows(&self.name, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap(),
        )
    }

    #[tokio::test]
    async fn csv_files_are_normalized() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("AAPL.csv"),
            "date,open,high,low,close,volume\n\
             2023-01-03,130.28,130.90,124.17,125.07,112117500\n\
             2023-01-02,129.50,130.00,128.00,129.93,90000000\n",
        )
        .unwrap();

        let adapter = CsvDirAdapter::new(dir.path()).unwrap();
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("AAPL", start, end, Timeframe::D1)
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert!(batch.rows()[0].ts < batch.rows()[1].ts);
        assert_eq!(batch.rows()[1].close, dec!(125.07));
    }

    #[tokio::test]
    async fn crypto_symbols_map_to_dashed_files() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("BTC-USDT.csv"),
            "timestamp,open,high,low,close,volume\n\
             2023-06-01 12:00:00,27000.5,27100.0,26900.25,27050.75,123.456\n",
        )
        .unwrap();

        let adapter = CsvDirAdapter::new(dir.path()).unwrap();
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("BTC/USDT", start, end, Timeframe::H1)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.rows()[0].low, dec!(26900.25));
    }

    #[tokio::test]
    async fn missing_file_is_symbol_not_found() {
        let dir = tempdir().unwrap();
        let adapter = CsvDirAdapter::new(dir.path()).unwrap();
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("MISSING", start, end, Timeframe::D1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::SymbolNotFound { .. }));
    }

    #[tokio::test]
    async fn bad_rows_are_parse_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("BAD.csv"),
            "date,open,high,low,close,volume\n2023-01-02,abc,1,1,1,1\n",
        )
        .unwrap();

        let adapter = CsvDirAdapter::new(dir.path()).unwrap();
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("BAD", start, end, Timeframe::D1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Parse { .. }));
    }

    #[test]
    fn missing_directory_is_fatal_at_construction() {
        assert!(matches!(
            CsvDirAdapter::new("/definitely/not/a/dir"),
            Err(AdapterError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn rows_outside_range_are_filtered() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("AAPL.csv"),
            "date,open,high,low,close,volume\n2019-01-02,1,2,0.5,1.5,10\n",
        )
        .unwrap();

        let adapter = CsvDirAdapter::new(dir.path()).unwrap();
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("AAPL", start, end, Timeframe::D1)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
}
