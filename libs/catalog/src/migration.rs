//! Legacy catalog migration.
//!
//! A legacy catalog carries only the provenance and quality tables
//! (schema version 1). Migration upgrades it in place to the unified layout,
//! after copying the database into a timestamped backup directory with a
//! manifest sufficient for rollback.

use crate::error::{CatalogError, Result};
use crate::SCHEMA_VERSION;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Rollback manifest written next to the backed-up database file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Hex SHA-256 of the original database file.
    pub original_checksum: String,
    /// Files copied into the backup directory.
    pub files: Vec<String>,
    /// Bundles present at backup time.
    pub bundle_count: i64,
    /// UTC epoch seconds of the backup.
    pub created_at: i64,
}

/// Outcome of a completed migration.
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub backup_dir: PathBuf,
    pub bundle_count: i64,
    pub from_version: i64,
    pub to_version: i64,
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Whether the database at `path` is a legacy catalog that needs upgrading.
pub fn needs_migration(path: &Path) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let conn = Connection::open(path)?;
    let has_metadata = table_exists(&conn, "bundle_metadata")?;
    let has_symbols = table_exists(&conn, "bundle_symbols")?;
    let has_cache = table_exists(&conn, "bundle_cache")?;
    Ok(has_metadata && (!has_symbols || !has_cache))
}

fn file_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| CatalogError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Upgrade a legacy catalog in place.
///
/// Steps: checksum the original, copy it into
/// `<backup_root>/backups/catalog-backup-<epoch>/` with a JSON manifest,
/// create the missing tables, stamp `schema_version`. The original file is
/// only modified after the backup is durable on disk.
pub fn migrate_legacy_catalog(db_path: &Path, backup_root: &Path) -> Result<MigrationReport> {
    if !needs_migration(db_path)? {
        return Err(CatalogError::Migration(format!(
            "{} is not a legacy catalog",
            db_path.display()
        )));
    }

    let checksum = file_checksum(db_path)?;
    let conn = Connection::open(db_path)?;
    let bundle_count: i64 =
        conn.query_row("SELECT COUNT(*) FROM bundle_metadata", [], |row| row.get(0))?;
    let from_version: i64 = if table_exists(&conn, "schema_version")? {
        conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?
        .unwrap_or(1)
    } else {
        1
    };
    drop(conn);

    // Backup first; the upgrade only proceeds once the copy and manifest are
    // flushed.
    let epoch = Utc::now().timestamp();
    let backup_dir = backup_root
        .join("backups")
        .join(format!("catalog-backup-{epoch}"));
    fs::create_dir_all(&backup_dir).map_err(|e| CatalogError::io(&backup_dir, e))?;

    let file_name = db_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("catalog.db")
        .to_string();
    let backup_file = backup_dir.join(&file_name);
    fs::copy(db_path, &backup_file).map_err(|e| CatalogError::io(&backup_file, e))?;

    let manifest = BackupManifest {
        original_checksum: checksum,
        files: vec![file_name],
        bundle_count,
        created_at: epoch,
    };
    let manifest_path = backup_dir.join("manifest.json");
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
        .map_err(|e| CatalogError::io(&manifest_path, e))?;

    // Upgrade in place inside one transaction.
    let mut conn = Connection::open(db_path)?;
    let tx = conn.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

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
         );",
    )?;
    tx.execute("DELETE FROM schema_version", [])?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;
    tx.commit()?;

    info!(
        db = %db_path.display(),
        backup = %backup_dir.display(),
        bundle_count,
        from_version,
        to_version = SCHEMA_VERSION,
        "catalog_migrated"
    );

    Ok(MigrationReport {
        backup_dir,
        bundle_count,
        from_version,
        to_version: SCHEMA_VERSION,
    })
}

/// Restore a catalog from a backup directory, verifying the manifest
/// checksum after the copy.
pub fn rollback_from_backup(backup_dir: &Path, db_path: &Path) -> Result<()> {
    let manifest_path = backup_dir.join("manifest.json");
    let manifest_bytes =
        fs::read(&manifest_path).map_err(|e| CatalogError::io(&manifest_path, e))?;
    let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)?;

    let Some(file_name) = manifest.files.first() else {
        return Err(CatalogError::Migration(
            "backup manifest lists no files".to_string(),
        ));
    };
    let backup_file = backup_dir.join(file_name);
    fs::copy(&backup_file, db_path).map_err(|e| CatalogError::io(&backup_file, e))?;

    let restored = file_checksum(db_path)?;
    if restored != manifest.original_checksum {
        warn!(
            expected = %manifest.original_checksum,
            actual = %restored,
            "rollback_checksum_mismatch"
        );
        return Err(CatalogError::Migration(
            "restored catalog checksum does not match manifest".to_string(),
        ));
    }
    info!(db = %db_path.display(), "catalog_rolled_back");
    Ok(())
}
