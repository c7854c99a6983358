//! # Vela Metadata Catalog
//!
//! Single source of truth for everything the data plane knows about its
//! bundles: provenance, quality metrics, symbol listings, and the fetch
//! cache - one SQLite database per installation, every mutation inside a
//! transaction.
//!
//! The catalog owns its connection; components borrow a `&Catalog` for the
//! duration of a call. Tests construct a throwaway instance against a temp
//! directory - there is no process-global state.
//!
//! ## Tables
//!
//! - `bundle_metadata` - provenance, one row per bundle, upserted.
//! - `data_quality_metrics` - append-only; latest `validation_timestamp`
//!   wins.
//! - `bundle_symbols` - unique `(bundle_name, symbol)`; the row id is the
//!   bundle-local sid.
//! - `bundle_cache` - fetch-cache entries bound to on-disk bar files.
//! - `cache_stats_daily` - per-day hit/miss/size/latency counters.
//! - `schema_version` - single-row version stamp; see [`migration`].

pub mod error;
pub mod migration;
pub mod records;

pub use error::{CatalogError, Result};
pub use migration::{migrate_legacy_catalog, needs_migration, MigrationReport};
pub use records::{BundleInfo, CacheEntry, CacheStats, Provenance, Quality, SymbolRecord};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use types::{AssetKind, Sid};

/// Current catalog schema version. Version 1 was the legacy layout carrying
/// provenance and quality only.
pub const SCHEMA_VERSION: i64 = 2;

/// Default catalog file name under a data root.
pub const CATALOG_FILE_NAME: &str = "catalog.db";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bundle_metadata (
    bundle_name TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    source_url TEXT,
    api_version TEXT,
    fetch_timestamp INTEGER NOT NULL,
    data_version TEXT,
    checksum TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS data_quality_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_name TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    start_date INTEGER,
    end_date INTEGER,
    missing_days_count INTEGER NOT NULL DEFAULT 0,
    missing_days_list TEXT NOT NULL DEFAULT '[]',
    outlier_count INTEGER NOT NULL DEFAULT 0,
    ohlcv_violations INTEGER NOT NULL DEFAULT 0,
    validation_timestamp INTEGER NOT NULL,
    validation_passed INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_quality_bundle_ts
    ON data_quality_metrics(bundle_name, validation_timestamp DESC);

CREATE TABLE IF NOT EXISTS bundle_symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bundle_name TEXT NOT NULL,
    symbol TEXT NOT NULL,
    asset_type TEXT,
    exchange TEXT,
    UNIQUE (bundle_name, symbol)
);

CREATE TABLE IF NOT EXISTS bundle_cache (
    cache_key TEXT PRIMARY KEY,
    bundle_name TEXT NOT NULL,
    bundle_path TEXT NOT NULL,
    fetch_timestamp INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_lru ON bundle_cache(last_accessed ASC);

CREATE TABLE IF NOT EXISTS cache_stats_daily (
    stat_date TEXT PRIMARY KEY,
    hit_count INTEGER NOT NULL DEFAULT 0,
    miss_count INTEGER NOT NULL DEFAULT 0,
    total_size_bytes INTEGER NOT NULL DEFAULT 0,
    avg_fetch_latency_ms REAL NOT NULL DEFAULT 0
);
";

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

fn date_to_epoch(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).expect("midnight").and_utc().timestamp()
}

fn epoch_to_date(epoch: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(epoch, 0).map(|dt| dt.date_naive())
}

fn encode_days(days: &[NaiveDate]) -> Result<String> {
    let strings: Vec<String> = days.iter().map(|d| d.to_string()).collect();
    Ok(serde_json::to_string(&strings)?)
}

fn decode_days(json: &str) -> Vec<NaiveDate> {
    serde_json::from_str::<Vec<String>>(json)
        .unwrap_or_default()
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Unified metadata catalog backed by one SQLite file.
pub struct Catalog {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Catalog {
    /// Open (or create) the catalog at an explicit file path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        debug!(path = %path.display(), "catalog_opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open the catalog under a data root (`<root>/catalog.db`).
    pub fn open_in(root: impl AsRef<Path>) -> Result<Self> {
        Self::open(root.as_ref().join(CATALOG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schema version currently stamped in the database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })?)
    }

    // ========================================================================
    // Provenance
    // ========================================================================

    /// Insert or update a bundle's provenance row, stamping `updated_at`.
    pub fn upsert_provenance(&self, bundle: &str, provenance: &Provenance) -> Result<()> {
        let now = now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bundle_metadata (
                bundle_name, source_type, source_url, api_version,
                fetch_timestamp, data_version, checksum, timezone,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(bundle_name) DO UPDATE SET
                source_type = excluded.source_type,
                source_url = excluded.source_url,
                api_version = excluded.api_version,
                fetch_timestamp = excluded.fetch_timestamp,
                data_version = excluded.data_version,
                checksum = excluded.checksum,
                timezone = excluded.timezone,
                updated_at = excluded.updated_at",
            params![
                bundle,
                provenance.source_type,
                provenance.source_url,
                provenance.api_version,
                provenance.fetch_timestamp,
                provenance.data_version,
                provenance.checksum,
                provenance.timezone,
                now,
            ],
        )?;
        info!(bundle, source = %provenance.source_type, "provenance_updated");
        Ok(())
    }

    fn provenance_from_row(row: &Row<'_>) -> rusqlite::Result<(String, Provenance, i64, i64)> {
        Ok((
            row.get("bundle_name")?,
            Provenance {
                source_type: row.get("source_type")?,
                source_url: row.get("source_url")?,
                api_version: row.get("api_version")?,
                fetch_timestamp: row.get("fetch_timestamp")?,
                data_version: row.get("data_version")?,
                checksum: row.get("checksum")?,
                timezone: row.get("timezone")?,
            },
            row.get("created_at")?,
            row.get("updated_at")?,
        ))
    }

    /// Merged view of one bundle: provenance plus latest quality.
    pub fn bundle(&self, bundle: &str) -> Result<Option<BundleInfo>> {
        let conn = self.conn.lock();
        let head = conn
            .query_row(
                "SELECT * FROM bundle_metadata WHERE bundle_name = ?1",
                params![bundle],
                Self::provenance_from_row,
            )
            .optional()?;
        let Some((bundle_name, provenance, created_at, updated_at)) = head else {
            return Ok(None);
        };
        let quality = Self::latest_quality_with(&conn, bundle)?;
        Ok(Some(BundleInfo {
            bundle_name,
            provenance,
            created_at,
            updated_at,
            quality,
        }))
    }

    /// Like [`Catalog::bundle`], but an absent bundle is an error. Callers
    /// that cannot proceed without the bundle (the CLI's info/validate
    /// paths) use this to surface `BundleNotFound` with the name attached.
    pub fn require_bundle(&self, bundle: &str) -> Result<BundleInfo> {
        self.bundle(bundle)?.ok_or_else(|| CatalogError::BundleNotFound {
            bundle: bundle.to_string(),
        })
    }

    /// All bundles with their latest quality, optionally filtered by source.
    pub fn list_bundles(&self, source_type: Option<&str>) -> Result<Vec<BundleInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT bundle_name FROM bundle_metadata
             WHERE (?1 IS NULL OR source_type = ?1)
             ORDER BY bundle_name",
        )?;
        let names: Vec<String> = stmt
            .query_map(params![source_type], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let mut bundles = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.bundle(&name)? {
                bundles.push(info);
            }
        }
        Ok(bundles)
    }

    /// Delete a bundle and cascade to quality, symbols, and cache rows in
    /// one transaction. Returns false when the bundle was absent.
    pub fn delete_bundle(&self, bundle: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM data_quality_metrics WHERE bundle_name = ?1",
            params![bundle],
        )?;
        tx.execute(
            "DELETE FROM bundle_symbols WHERE bundle_name = ?1",
            params![bundle],
        )?;
        tx.execute(
            "DELETE FROM bundle_cache WHERE bundle_name = ?1",
            params![bundle],
        )?;
        let deleted = tx.execute(
            "DELETE FROM bundle_metadata WHERE bundle_name = ?1",
            params![bundle],
        )?;
        tx.commit()?;
        info!(bundle, deleted = deleted > 0, "bundle_deleted");
        Ok(deleted > 0)
    }

    // ========================================================================
    // Quality metrics
    // ========================================================================

    /// Append one quality record. The table is append-only; history is kept.
    pub fn record_quality(&self, bundle: &str, quality: &Quality) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO data_quality_metrics (
                bundle_name, row_count, start_date, end_date,
                missing_days_count, missing_days_list, outlier_count,
                ohlcv_violations, validation_timestamp, validation_passed
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                bundle,
                quality.row_count,
                quality.start_date.map(date_to_epoch),
                quality.end_date.map(date_to_epoch),
                quality.missing_days_count,
                encode_days(&quality.missing_days)?,
                quality.outlier_count,
                quality.ohlcv_violations,
                quality.validation_timestamp,
                quality.validation_passed,
            ],
        )?;
        debug!(
            bundle,
            rows = quality.row_count,
            passed = quality.validation_passed,
            "quality_recorded"
        );
        Ok(())
    }

    fn quality_from_row(row: &Row<'_>) -> rusqlite::Result<Quality> {
        let start: Option<i64> = row.get("start_date")?;
        let end: Option<i64> = row.get("end_date")?;
        let days_json: String = row.get("missing_days_list")?;
        Ok(Quality {
            row_count: row.get("row_count")?,
            start_date: start.and_then(epoch_to_date),
            end_date: end.and_then(epoch_to_date),
            missing_days_count: row.get("missing_days_count")?,
            missing_days: decode_days(&days_json),
            outlier_count: row.get("outlier_count")?,
            ohlcv_violations: row.get("ohlcv_violations")?,
            validation_timestamp: row.get("validation_timestamp")?,
            validation_passed: row.get("validation_passed")?,
        })
    }

    fn latest_quality_with(conn: &Connection, bundle: &str) -> Result<Option<Quality>> {
        Ok(conn
            .query_row(
                "SELECT * FROM data_quality_metrics
                 WHERE bundle_name = ?1
                 ORDER BY validation_timestamp DESC, id DESC
                 LIMIT 1",
                params![bundle],
                Self::quality_from_row,
            )
            .optional()?)
    }

    /// Latest quality record for a bundle, if any.
    pub fn latest_quality(&self, bundle: &str) -> Result<Option<Quality>> {
        let conn = self.conn.lock();
        Self::latest_quality_with(&conn, bundle)
    }

    // ========================================================================
    // Symbols
    // ========================================================================

    /// Insert or refresh a symbol row; returns the bundle-local sid.
    pub fn upsert_symbol(
        &self,
        bundle: &str,
        symbol: &str,
        asset_kind: AssetKind,
        exchange: Option<&str>,
    ) -> Result<Sid> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO bundle_symbols (bundle_name, symbol, asset_type, exchange)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(bundle_name, symbol) DO UPDATE SET
                asset_type = excluded.asset_type,
                exchange = excluded.exchange",
            params![bundle, symbol, asset_kind.as_str(), exchange],
        )?;
        let sid: Sid = tx.query_row(
            "SELECT id FROM bundle_symbols WHERE bundle_name = ?1 AND symbol = ?2",
            params![bundle, symbol],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(sid)
    }

    /// All symbols tracked under a bundle, ascending by sid.
    pub fn symbols(&self, bundle: &str) -> Result<Vec<SymbolRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, bundle_name, symbol, asset_type, exchange
             FROM bundle_symbols WHERE bundle_name = ?1 ORDER BY id",
        )?;
        let records = stmt
            .query_map(params![bundle], |row| {
                let kind: Option<String> = row.get("asset_type")?;
                Ok(SymbolRecord {
                    sid: row.get("id")?,
                    bundle_name: row.get("bundle_name")?,
                    symbol: row.get("symbol")?,
                    asset_kind: kind
                        .map(|k| AssetKind::parse(&k))
                        .unwrap_or(AssetKind::Unknown),
                    exchange: row.get("exchange")?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(records)
    }

    /// Sid for a symbol already tracked under a bundle.
    pub fn symbol_sid(&self, bundle: &str, symbol: &str) -> Result<Option<Sid>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT id FROM bundle_symbols WHERE bundle_name = ?1 AND symbol = ?2",
                params![bundle, symbol],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ========================================================================
    // Cache entries
    // ========================================================================

    /// Record a fresh cache entry (or refresh `last_accessed` on an existing
    /// key, matching re-ingest semantics).
    pub fn insert_cache_entry(
        &self,
        cache_key: &str,
        bundle: &str,
        bundle_path: &str,
        size_bytes: i64,
    ) -> Result<()> {
        let now = now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bundle_cache (
                cache_key, bundle_name, bundle_path, fetch_timestamp,
                size_bytes, last_accessed
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?4)
             ON CONFLICT(cache_key) DO UPDATE SET
                bundle_path = excluded.bundle_path,
                size_bytes = excluded.size_bytes,
                last_accessed = excluded.last_accessed",
            params![cache_key, bundle, bundle_path, now, size_bytes],
        )?;
        Ok(())
    }

    fn cache_entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
        Ok(CacheEntry {
            cache_key: row.get("cache_key")?,
            bundle_name: row.get("bundle_name")?,
            bundle_path: row.get("bundle_path")?,
            fetch_timestamp: row.get("fetch_timestamp")?,
            size_bytes: row.get("size_bytes")?,
            last_accessed: row.get("last_accessed")?,
        })
    }

    /// Look up a cache entry without touching its access time.
    pub fn cache_entry(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT * FROM bundle_cache WHERE cache_key = ?1",
                params![cache_key],
                Self::cache_entry_from_row,
            )
            .optional()?)
    }

    /// Stamp `last_accessed` on a hit. Concurrent hits may reorder their
    /// stamps; none are lost.
    pub fn touch_cache_entry(&self, cache_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bundle_cache SET last_accessed = ?2 WHERE cache_key = ?1",
            params![cache_key, now_epoch()],
        )?;
        Ok(())
    }

    /// All cache entries, least recently used first.
    pub fn cache_entries_by_lru(&self) -> Result<Vec<CacheEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM bundle_cache ORDER BY last_accessed ASC, cache_key ASC",
        )?;
        let entries = stmt
            .query_map([], Self::cache_entry_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }

    /// Total bytes currently tracked in the cache.
    pub fn cache_total_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM bundle_cache",
            [],
            |row| row.get(0),
        )?)
    }

    /// Evict one entry: the row is deleted in a transaction that commits only
    /// after `delete_files` succeeds, so files disappear only while the
    /// matching row is held. Returns false when the key was absent.
    pub fn evict_cache_entry<F>(&self, cache_key: &str, delete_files: F) -> Result<bool>
    where
        F: FnOnce(&CacheEntry) -> std::io::Result<()>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let entry = tx
            .query_row(
                "SELECT * FROM bundle_cache WHERE cache_key = ?1",
                params![cache_key],
                Self::cache_entry_from_row,
            )
            .optional()?;
        let Some(entry) = entry else {
            return Ok(false);
        };
        tx.execute(
            "DELETE FROM bundle_cache WHERE cache_key = ?1",
            params![cache_key],
        )?;
        delete_files(&entry)
            .map_err(|e| CatalogError::io(PathBuf::from(&entry.bundle_path), e))?;
        tx.commit()?;
        debug!(cache_key, size_bytes = entry.size_bytes, "cache_entry_evicted");
        Ok(true)
    }

    // ========================================================================
    // Cache statistics
    // ========================================================================

    fn bump_cache_stat(&self, hit: bool, latency_ms: f64, total_size: Option<i64>) -> Result<()> {
        let stat_date = Utc::now().date_naive().to_string();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<(i64, i64, i64, f64)> = tx
            .query_row(
                "SELECT hit_count, miss_count, total_size_bytes, avg_fetch_latency_ms
                 FROM cache_stats_daily WHERE stat_date = ?1",
                params![stat_date],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (hits, misses, size, avg) = existing.unwrap_or((0, 0, 0, 0.0));
        let lookups = (hits + misses) as f64;
        let new_avg = (avg * lookups + latency_ms) / (lookups + 1.0);
        let (hits, misses) = if hit { (hits + 1, misses) } else { (hits, misses + 1) };
        let size = total_size.unwrap_or(size);

        tx.execute(
            "INSERT INTO cache_stats_daily (
                stat_date, hit_count, miss_count, total_size_bytes, avg_fetch_latency_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(stat_date) DO UPDATE SET
                hit_count = excluded.hit_count,
                miss_count = excluded.miss_count,
                total_size_bytes = excluded.total_size_bytes,
                avg_fetch_latency_ms = excluded.avg_fetch_latency_ms",
            params![stat_date, hits, misses, size, new_avg],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Count a cache hit for today; hits contribute zero latency.
    pub fn bump_cache_hit(&self) -> Result<()> {
        self.bump_cache_stat(true, 0.0, None)
    }

    /// Count a cache miss for today with its measured fetch latency and a
    /// snapshot of the total cache size after the miss was recorded.
    pub fn bump_cache_miss(&self, latency_ms: f64, total_size_bytes: i64) -> Result<()> {
        self.bump_cache_stat(false, latency_ms, Some(total_size_bytes))
    }

    /// Daily stats rows over the trailing `days` window, oldest first.
    pub fn cache_stats_window(&self, days: u32) -> Result<Vec<CacheStats>> {
        let cutoff = (Utc::now().date_naive() - chrono::Duration::days(days as i64)).to_string();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT stat_date, hit_count, miss_count, total_size_bytes, avg_fetch_latency_ms
             FROM cache_stats_daily WHERE stat_date > ?1 ORDER BY stat_date ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| {
                let date_str: String = row.get("stat_date")?;
                Ok((
                    date_str,
                    CacheStats {
                        stat_date: NaiveDate::default(),
                        hit_count: row.get("hit_count")?,
                        miss_count: row.get("miss_count")?,
                        total_size_bytes: row.get("total_size_bytes")?,
                        avg_fetch_latency_ms: row.get("avg_fetch_latency_ms")?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(date_str, mut stats)| {
                stats.stat_date = date_str.parse().ok()?;
                Some(stats)
            })
            .collect())
    }

    /// Count bundles (used by the migration manifest).
    pub fn count_bundles(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM bundle_metadata", [], |row| row.get(0))?)
    }
}
