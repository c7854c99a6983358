//! Atomic partitioned Parquet writes.

use crate::error::{Result, StoreError};
use crate::schema::{daily_bars_schema, minute_bars_schema, record_batch_from_rows, Partition};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use types::{validate_bars, BarBatch, BarRow, Timeframe};

pub const DAILY_BARS_DIR: &str = "daily_bars";
pub const MINUTE_BARS_DIR: &str = "minute_bars";
pub const DATA_FILE_NAME: &str = "data.parquet";

/// Block-compression choice for written files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarCompression {
    /// Lightweight, fast to decode.
    Snappy,
    /// Strong, smaller files.
    #[default]
    Zstd,
}

impl BarCompression {
    fn parquet(&self) -> Compression {
        match self {
            BarCompression::Snappy => Compression::SNAPPY,
            BarCompression::Zstd => Compression::ZSTD(ZstdLevel::try_new(3).unwrap_or_default()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BarCompression::Snappy => "snappy",
            BarCompression::Zstd => "zstd",
        }
    }
}

/// Outcome of one partition write: the renamed file plus the facts the
/// cataloging stage records about it.
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub partition: Partition,
    pub rows: usize,
    pub size_bytes: u64,
    /// Hex SHA-256 of the file content, computed after the rename.
    pub checksum: String,
}

/// Writes canonical bar batches into the partitioned store under one bundle
/// root. The writer owns bar files up to the rename; after that they are
/// read-only.
pub struct BarWriter {
    root: PathBuf,
}

impl BarWriter {
    /// Create a writer rooted at a bundle directory, creating the daily and
    /// minute subtrees if needed.
    pub fn new(bundle_root: impl Into<PathBuf>) -> Result<Self> {
        let root = bundle_root.into();
        for sub in [DAILY_BARS_DIR, MINUTE_BARS_DIR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a validated batch, fanning out over derived partitions. Each
    /// partition gets exactly one file and one rename. Returns one
    /// [`WrittenFile`] per touched partition; an empty batch writes nothing.
    ///
    /// The whole batch is validated up front: a single incoherent row aborts
    /// the call before any file is created.
    pub fn write(
        &self,
        batch: &BarBatch,
        timeframe: Timeframe,
        compression: BarCompression,
    ) -> Result<Vec<WrittenFile>> {
        if batch.is_empty() {
            debug!(root = %self.root.display(), "empty_batch_skipped");
            return Ok(Vec::new());
        }
        validate_bars(batch)?;

        let daily = timeframe.is_daily();
        let mut partitions: BTreeMap<Partition, Vec<BarRow>> = BTreeMap::new();
        for row in batch.iter() {
            partitions
                .entry(Partition::for_instant(row.ts, !daily))
                .or_default()
                .push(row.clone());
        }

        let mut written = Vec::with_capacity(partitions.len());
        for (partition, rows) in partitions {
            written.push(self.write_partition(&partition, &rows, daily, compression)?);
        }

        info!(
            root = %self.root.display(),
            files = written.len(),
            rows = batch.len(),
            compression = compression.label(),
            "bars_written"
        );
        Ok(written)
    }

    fn write_partition(
        &self,
        partition: &Partition,
        rows: &[BarRow],
        daily: bool,
        compression: BarCompression,
    ) -> Result<WrittenFile> {
        let base = if daily {
            self.root.join(DAILY_BARS_DIR)
        } else {
            self.root.join(MINUTE_BARS_DIR)
        };
        let dir = base.join(partition.relative_dir());
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let tmp_path = dir.join(format!(".{DATA_FILE_NAME}.tmp.{nonce}"));
        let final_path = dir.join(DATA_FILE_NAME);

        match self.write_file(&tmp_path, rows, daily, compression) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        }

        // Durable before visible: flush the temp file, then rename over any
        // previous partition content. Last rename wins.
        if let Ok(f) = File::open(&tmp_path) {
            let _ = f.sync_all();
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::io(&final_path, e));
        }

        let size_bytes = fs::metadata(&final_path)
            .map_err(|e| StoreError::io(&final_path, e))?
            .len();
        let checksum = file_checksum(&final_path)?;

        debug!(
            path = %final_path.display(),
            rows = rows.len(),
            size_bytes,
            "partition_written_atomically"
        );

        Ok(WrittenFile {
            path: final_path,
            partition: *partition,
            rows: rows.len(),
            size_bytes,
            checksum,
        })
    }

    fn write_file(
        &self,
        path: &Path,
        rows: &[BarRow],
        daily: bool,
        compression: BarCompression,
    ) -> Result<()> {
        let schema = if daily {
            daily_bars_schema()
        } else {
            minute_bars_schema()
        };
        let record_batch = record_batch_from_rows(rows, daily)?;

        let props = WriterProperties::builder()
            .set_compression(compression.parquet())
            .set_dictionary_enabled(true)
            .set_statistics_enabled(EnabledStatistics::Chunk)
            .build();

        let file = File::create(path).map_err(|e| StoreError::io(path, e))?;
        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        writer.write(&record_batch)?;
        writer.close()?;
        Ok(())
    }
}

/// Hex SHA-256 of a file's content.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;
    use types::BarRow;

    fn daily_row(day: u32, sid: i64) -> BarRow {
        BarRow {
            ts: Utc.with_ymd_and_hms(2023, 1, day, 0, 0, 0).unwrap(),
            sid,
            open: dec!(100),
            high: dec!(105),
            low: dec!(95),
            close: dec!(102.5),
            volume: dec!(1000),
        }
    }

    #[test]
    fn single_row_touches_exactly_one_partition() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let batch = BarBatch::from_rows(vec![daily_row(2, 1)]);

        let written = writer.write(&batch, Timeframe::D1, BarCompression::Zstd).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0]
            .path
            .ends_with("daily_bars/year=2023/month=01/data.parquet"));
        assert_eq!(written[0].rows, 1);
        assert!(written[0].size_bytes > 0);
        assert_eq!(written[0].checksum.len(), 64);
    }

    #[test]
    fn batch_fans_out_over_partitions() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let mut feb = daily_row(1, 1);
        feb.ts = Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap();
        let batch = BarBatch::from_rows(vec![daily_row(15, 1), feb]);

        let written = writer.write(&batch, Timeframe::D1, BarCompression::Snappy).unwrap();
        assert_eq!(written.len(), 2);
    }

    #[test]
    fn incoherent_row_aborts_whole_batch() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let mut bad = daily_row(2, 1);
        bad.high = dec!(10);
        bad.low = dec!(90);
        let batch = BarBatch::from_rows(vec![daily_row(1, 1), bad]);

        let err = writer.write(&batch, Timeframe::D1, BarCompression::Zstd);
        assert!(matches!(err, Err(StoreError::InvalidBatch(_))));
        // No partition directory may contain a data file.
        let daily_dir = dir.path().join(DAILY_BARS_DIR);
        let mut stack = vec![daily_dir];
        while let Some(d) = stack.pop() {
            if let Ok(entries) = fs::read_dir(&d) {
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.is_dir() {
                        stack.push(p);
                    } else {
                        panic!("unexpected file {p:?}");
                    }
                }
            }
        }
    }

    #[test]
    fn empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let written = writer
            .write(&BarBatch::empty(), Timeframe::D1, BarCompression::Zstd)
            .unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn rewrite_replaces_partition_content() {
        let dir = tempdir().unwrap();
        let writer = BarWriter::new(dir.path()).unwrap();
        let first = BarBatch::from_rows(vec![daily_row(1, 1)]);
        let second = BarBatch::from_rows(vec![daily_row(1, 1), daily_row(2, 1)]);

        writer.write(&first, Timeframe::D1, BarCompression::Zstd).unwrap();
        let written = writer.write(&second, Timeframe::D1, BarCompression::Zstd).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].rows, 2);
    }
}
