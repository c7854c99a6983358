//! Partition-pruned Parquet reads.

use crate::error::{Result, StoreError};
use crate::schema::{
    check_schema, daily_bars_schema, date_to_days, minute_bars_schema, rows_from_record_batch,
    Partition,
};
use crate::writer::{DAILY_BARS_DIR, DATA_FILE_NAME, MINUTE_BARS_DIR};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::metadata::ParquetMetaData;
use parquet::file::statistics::Statistics;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use types::{BarBatch, BarRow, Sid};

/// Read-only access to one bundle's bar files.
///
/// Readers take no locks and hold no state beyond the bundle root; any number
/// of concurrent readers may scan the same files, including while a writer is
/// renaming a fresh partition into place.
pub struct BarReader {
    root: PathBuf,
}

impl BarReader {
    pub fn new(bundle_root: impl Into<PathBuf>) -> Self {
        Self {
            root: bundle_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load daily bars for the given sids over an inclusive date range.
    /// An empty `sids` slice means every sid. Missing partitions yield an
    /// empty batch, never an error.
    pub fn load_daily(&self, sids: &[Sid], start: NaiveDate, end: NaiveDate) -> Result<BarBatch> {
        let start_ts = start.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let end_ts = end.and_hms_opt(23, 59, 59).expect("valid time").and_utc();
        self.load(DAILY_BARS_DIR, true, sids, start_ts, end_ts)
    }

    /// Load intraday bars for the given sids over an inclusive instant range.
    pub fn load_minute(
        &self,
        sids: &[Sid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarBatch> {
        self.load(MINUTE_BARS_DIR, false, sids, start, end)
    }

    fn load(
        &self,
        subdir: &str,
        daily: bool,
        sids: &[Sid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BarBatch> {
        let base = self.root.join(subdir);
        if !base.is_dir() {
            return Ok(BarBatch::empty());
        }

        let mut rows: Vec<BarRow> = Vec::new();
        for partition in scan_partitions(&base, !daily)? {
            if !partition_overlaps(&partition, start, end) {
                trace!(partition = %partition.relative_dir(), "partition_pruned");
                continue;
            }
            let file_path = base.join(partition.relative_dir()).join(DATA_FILE_NAME);
            if !file_path.is_file() {
                continue;
            }
            rows.extend(self.read_file(&file_path, daily, sids, start, end)?);
        }

        debug!(
            root = %self.root.display(),
            subdir,
            rows = rows.len(),
            "bars_loaded"
        );
        Ok(BarBatch::from_rows(rows))
    }

    fn read_file(
        &self,
        path: &Path,
        daily: bool,
        sids: &[Sid],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BarRow>> {
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let expected = if daily {
            daily_bars_schema()
        } else {
            minute_bars_schema()
        };
        check_schema(builder.schema(), &expected, path)?;

        if !file_stats_overlap(builder.metadata(), daily, start, end) {
            trace!(path = %path.display(), "file_skipped_by_statistics");
            return Ok(Vec::new());
        }

        let reader = builder.build()?;
        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            for row in rows_from_record_batch(&batch, daily, path)? {
                if row.ts < start || row.ts > end {
                    continue;
                }
                if !sids.is_empty() && !sids.contains(&row.sid) {
                    continue;
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

/// Enumerate partition directories under a bar subtree.
fn scan_partitions(base: &Path, with_day: bool) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    for year_entry in read_dir_sorted(base)? {
        let Some(year) = parse_key(&year_entry, "year=") else {
            continue;
        };
        for month_entry in read_dir_sorted(&base.join(&year_entry))? {
            let Some(month) = parse_key(&month_entry, "month=") else {
                continue;
            };
            if with_day {
                let month_dir = base.join(&year_entry).join(&month_entry);
                for day_entry in read_dir_sorted(&month_dir)? {
                    if let Some(day) = parse_key(&day_entry, "day=") {
                        partitions.push(Partition {
                            year,
                            month: month as u32,
                            day: Some(day as u32),
                        });
                    }
                }
            } else {
                partitions.push(Partition {
                    year,
                    month: month as u32,
                    day: None,
                });
            }
        }
    }
    Ok(partitions)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn parse_key(name: &str, prefix: &str) -> Option<i32> {
    name.strip_prefix(prefix)?.parse().ok()
}

fn partition_overlaps(partition: &Partition, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    match (partition.start(), partition.end_exclusive()) {
        (Some(p_start), Some(p_end)) => p_start <= end && start < p_end,
        _ => true, // unparseable bounds: read the file rather than drop data
    }
}

/// Check the footer statistics of the time column (always column 0) against
/// the query range. Files without complete statistics are read anyway.
fn file_stats_overlap(
    metadata: &ParquetMetaData,
    daily: bool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    let mut file_min: Option<i64> = None;
    let mut file_max: Option<i64> = None;

    for row_group in metadata.row_groups() {
        let Some(stats) = row_group.column(0).statistics() else {
            return true;
        };
        let (min, max) = match stats {
            Statistics::Int32(s) => match (s.min_opt(), s.max_opt()) {
                (Some(min), Some(max)) => (*min as i64, *max as i64),
                _ => return true,
            },
            Statistics::Int64(s) => match (s.min_opt(), s.max_opt()) {
                (Some(min), Some(max)) => (*min, *max),
                _ => return true,
            },
            _ => return true,
        };
        file_min = Some(file_min.map_or(min, |m| m.min(min)));
        file_max = Some(file_max.map_or(max, |m| m.max(max)));
    }

    let (Some(file_min), Some(file_max)) = (file_min, file_max) else {
        return true;
    };

    let (query_min, query_max) = if daily {
        (
            date_to_days(start.date_naive()) as i64,
            date_to_days(end.date_naive()) as i64,
        )
    } else {
        (start.timestamp_micros(), end.timestamp_micros())
    };

    file_min <= query_max && query_min <= file_max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{BarCompression, BarWriter};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use types::Timeframe;

    fn daily_row(day: u32, sid: Sid, close: rust_decimal::Decimal) -> BarRow {
        BarRow {
            ts: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
            sid,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(500),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn write_then_read_is_bit_exact() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let batch = BarBatch::from_rows(vec![
            daily_row(1, 1, dec!(100.50)),
            daily_row(2, 1, dec!(102.50)),
            daily_row(3, 1, dec!(104.50)),
        ]);
        writer.write(&batch, Timeframe::D1, BarCompression::Zstd).unwrap();

        let reader = BarReader::new(dir.path());
        let loaded = reader
            .load_daily(&[1], date(2023, 1, 1), date(2023, 1, 3))
            .unwrap();
        assert_eq!(loaded, batch);
        assert_eq!(loaded.rows()[1].close.to_string(), "102.50000000");
    }

    #[test]
    fn reader_filters_by_sid_and_range() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let batch = BarBatch::from_rows(vec![
            daily_row(1, 1, dec!(100)),
            daily_row(2, 1, dec!(101)),
            daily_row(2, 2, dec!(200)),
        ]);
        writer.write(&batch, Timeframe::D1, BarCompression::Zstd).unwrap();

        let reader = BarReader::new(dir.path());
        let loaded = reader
            .load_daily(&[2], date(2023, 1, 2), date(2023, 1, 2))
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.rows()[0].sid, 2);
    }

    #[test]
    fn missing_partitions_yield_empty_batch() {
        let dir = tempdir().unwrap();
        let reader = BarReader::new(dir.path());
        let loaded = reader
            .load_daily(&[1], date(2023, 1, 1), date(2023, 1, 31))
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn minute_bars_round_trip_with_day_partitions() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap();
        let row = BarRow {
            ts,
            sid: 9,
            open: dec!(1.1),
            high: dec!(1.2),
            low: dec!(1.0),
            close: dec!(1.15),
            volume: dec!(42),
        };
        let batch = BarBatch::from_rows(vec![row]);
        let written = writer.write(&batch, Timeframe::M1, BarCompression::Snappy).unwrap();
        assert!(written[0]
            .path
            .ends_with("minute_bars/year=2024/month=03/day=05/data.parquet"));

        let reader = BarReader::new(dir.path());
        let loaded = reader
            .load_minute(&[9], ts - chrono::Duration::minutes(1), ts)
            .unwrap();
        assert_eq!(loaded, batch);
    }

    #[test]
    fn out_of_range_query_reads_nothing() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let batch = BarBatch::from_rows(vec![daily_row(1, 1, dec!(100))]);
        writer.write(&batch, Timeframe::D1, BarCompression::Zstd).unwrap();

        let reader = BarReader::new(dir.path());
        let loaded = reader
            .load_daily(&[1], date(2024, 6, 1), date(2024, 6, 30))
            .unwrap();
        assert!(loaded.is_empty());
    }
}
