//! Ingestion orchestration.
//!
//! One job covers `(bundle, symbols, range, resolution)` and moves through
//! the stages
//!
//! ```text
//! NEW -> CACHE-LOOKUP -> (hit: DONE) | (miss: FETCHING)
//! FETCHING -> VALIDATING -> WRITING -> CATALOGING -> DONE
//! ```
//!
//! with any failure before CATALOGING leaving the catalog untouched: a file
//! renamed but not cataloged is an orphan, never canonical data, and a
//! fresh bundle's directory is removed outright. Only DONE exposes data to
//! readers. The stages are straight-line control flow: a job that returns
//! `Ok` reached DONE, and an `Err` names the failing stage through its
//! variant (`Fetch`, `Store` for the writing stage, `Catalog`).

use crate::cache::FetchCache;
use crate::error::{IngestError, Result};
use adapter_service::{AdapterError, OhlcvSource, RetryPolicy};
use catalog::{Catalog, Provenance, Quality};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use types::{infer_asset_kind, quality_report, BarBatch, BarRow, Timeframe};

/// One ingestion request.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub bundle: String,
    pub symbols: Vec<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timeframe: Timeframe,
}

/// What a completed (or resumed) job produced.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub bundle_path: PathBuf,
    pub cache_hit: bool,
    pub rows_written: usize,
    pub files_written: usize,
    /// Symbols that failed with their error text; empty on full success.
    pub failed_symbols: Vec<(String, String)>,
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Root directory holding `catalog.db` and one directory per bundle.
    pub data_root: PathBuf,
    pub compression: store::BarCompression,
    /// Continue the job when individual symbols fail.
    pub partial_success: bool,
    pub retry: RetryPolicy,
}

impl IngestConfig {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            compression: store::BarCompression::default(),
            partial_success: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives adapters, the writer, the catalog, and cache bookkeeping as one
/// unit per job. Owns the catalog; every other component borrows it.
pub struct Orchestrator {
    catalog: Catalog,
    config: IngestConfig,
}

impl Orchestrator {
    /// Open (or create) the catalog under the data root and build an
    /// orchestrator around it.
    pub fn open(config: IngestConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_root).map_err(|e| IngestError::Catalog {
            bundle: String::new(),
            source: catalog::CatalogError::Io {
                path: config.data_root.clone(),
                source: e,
            },
        })?;
        let catalog = Catalog::open_in(&config.data_root).map_err(|e| IngestError::Catalog {
            bundle: String::new(),
            source: e,
        })?;
        Ok(Self { catalog, config })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn bundle_path(&self, bundle: &str) -> PathBuf {
        self.config.data_root.join(bundle)
    }

    fn catalog_err(&self, bundle: &str, source: catalog::CatalogError) -> IngestError {
        IngestError::Catalog {
            bundle: bundle.to_string(),
            source,
        }
    }

    /// Run one job to completion. Safe to re-run: a warm cache short
    /// circuits to DONE, and a completed range recorded in the catalog is
    /// skipped without adapter calls.
    pub async fn run(&self, source: Arc<dyn OhlcvSource>, job: &IngestJob) -> Result<JobOutcome> {
        let bundle_path = self.bundle_path(&job.bundle);
        let cache = FetchCache::new(&self.catalog);
        let cache_key = FetchCache::key(
            source.name(),
            &source.provider_config(),
            &job.symbols,
            job.start,
            job.end,
            job.timeframe,
        );

        // CACHE-LOOKUP
        if let Some(entry) = cache.lookup(&job.bundle, &cache_key)? {
            info!(
                bundle = %job.bundle,
                cache_key = %cache_key,
                path = %entry.bundle_path,
                "ingest_cache_hit"
            );
            return Ok(JobOutcome {
                bundle_path: PathBuf::from(entry.bundle_path),
                cache_hit: true,
                rows_written: 0,
                files_written: 0,
                failed_symbols: Vec::new(),
            });
        }

        // Resume check: a previously completed ingest covering this range
        // makes the fetch unnecessary even with a cold cache key.
        if self.range_already_complete(&job.bundle, job)? && bundle_path.exists() {
            info!(bundle = %job.bundle, "ingest_resumed_from_catalog");
            let size = dir_size(&bundle_path);
            cache.record(
                &job.bundle,
                &cache_key,
                &bundle_path.to_string_lossy(),
                size,
                0.0,
            )?;
            return Ok(JobOutcome {
                bundle_path,
                cache_hit: true,
                rows_written: 0,
                files_written: 0,
                failed_symbols: Vec::new(),
            });
        }

        let fetch_started = Instant::now();
        let bundle_existed = self
            .catalog
            .bundle(&job.bundle)
            .map_err(|e| self.catalog_err(&job.bundle, e))?
            .is_some();

        let outcome = self
            .fetch_write_catalog(&source, job, &bundle_path, &cache, &cache_key, fetch_started)
            .await;

        if outcome.is_err() && !bundle_existed {
            // Partially-written files and pre-allocated symbol rows must not
            // outlive a failed job when the bundle is new; for an existing
            // bundle, leftover files are orphans the next successful rename
            // replaces.
            if bundle_path.exists() {
                warn!(bundle = %job.bundle, "removing_partial_bundle_after_failure");
                let _ = std::fs::remove_dir_all(&bundle_path);
            }
            let _ = self.catalog.delete_bundle(&job.bundle);
        }
        outcome
    }

    async fn fetch_write_catalog(
        &self,
        source: &Arc<dyn OhlcvSource>,
        job: &IngestJob,
        bundle_path: &Path,
        cache: &FetchCache<'_>,
        cache_key: &str,
        fetch_started: Instant,
    ) -> Result<JobOutcome> {
        // FETCHING
        let mut rows: Vec<BarRow> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut symbol_batches: Vec<(String, BarBatch)> = Vec::new();

        for symbol in &job.symbols {
            let fetch = self
                .config
                .retry
                .execute(source.name(), || {
                    source.fetch_ohlcv(symbol, job.start, job.end, job.timeframe)
                })
                .await;
            match fetch {
                Ok(batch) => symbol_batches.push((symbol.clone(), batch)),
                Err(err) => {
                    error!(
                        bundle = %job.bundle,
                        symbol = %symbol,
                        error = %err,
                        "symbol_fetch_failed"
                    );
                    let symbol_scoped =
                        matches!(err, AdapterError::SymbolNotFound { .. }) || !err.is_permanent();
                    if self.config.partial_success && symbol_scoped {
                        failed.push((symbol.clone(), err.to_string()));
                    } else {
                        return Err(IngestError::Fetch {
                            bundle: job.bundle.clone(),
                            symbol: Some(symbol.clone()),
                            start: job.start,
                            end: job.end,
                            source: err,
                        });
                    }
                }
            }
        }
        if symbol_batches.is_empty() && !failed.is_empty() {
            return Err(IngestError::AllSymbolsFailed {
                bundle: job.bundle.clone(),
                count: failed.len(),
                failures: failed,
            });
        }

        // VALIDATING: assign bundle-local sids, merge, and sweep quality.
        // Adapters validated each batch already; the merged batch is checked
        // again by the writer before anything lands on disk.
        for (symbol, batch) in symbol_batches {
            let sid = self
                .catalog
                .upsert_symbol(
                    &job.bundle,
                    &symbol,
                    infer_asset_kind(&symbol),
                    None,
                )
                .map_err(|e| self.catalog_err(&job.bundle, e))?;
            rows.extend(batch.into_iter().map(|mut row| {
                row.sid = sid;
                row
            }));
        }
        let merged = BarBatch::from_rows(rows);
        let report = quality_report(&merged, job.timeframe);

        if merged.is_empty() {
            // Empty provider response: no file, no catalog row.
            info!(bundle = %job.bundle, "ingest_empty_window");
            return Ok(JobOutcome {
                bundle_path: bundle_path.to_path_buf(),
                cache_hit: false,
                rows_written: 0,
                files_written: 0,
                failed_symbols: failed,
            });
        }

        // WRITING
        let writer = store::BarWriter::new(bundle_path).map_err(|e| IngestError::Store {
            bundle: job.bundle.clone(),
            source: e,
        })?;
        let written = writer
            .write(&merged, job.timeframe, self.config.compression)
            .map_err(|e| IngestError::Store {
                bundle: job.bundle.clone(),
                source: e,
            })?;
        let fetch_latency_ms = fetch_started.elapsed().as_secs_f64() * 1000.0;

        // CATALOGING: provenance, quality, and the cache entry become
        // visible together; readers only ever observe a fully cataloged
        // bundle.
        let checksum = combined_checksum(&written);
        let provenance = Provenance {
            source_type: source.name().to_string(),
            source_url: Some(source.source_url()),
            api_version: source.api_version(),
            fetch_timestamp: Utc::now().timestamp(),
            data_version: None,
            checksum,
            timezone: "UTC".to_string(),
        };
        self.catalog
            .upsert_provenance(&job.bundle, &provenance)
            .map_err(|e| self.catalog_err(&job.bundle, e))?;
        self.catalog
            .record_quality(
                &job.bundle,
                &Quality::from_report(&report, Utc::now().timestamp()),
            )
            .map_err(|e| self.catalog_err(&job.bundle, e))?;

        let total_bytes: i64 = written.iter().map(|f| f.size_bytes as i64).sum();
        cache.record(
            &job.bundle,
            cache_key,
            &bundle_path.to_string_lossy(),
            total_bytes,
            fetch_latency_ms,
        )?;

        info!(
            bundle = %job.bundle,
            rows = merged.len(),
            files = written.len(),
            failed_symbols = failed.len(),
            latency_ms = fetch_latency_ms as u64,
            "ingest_complete"
        );
        Ok(JobOutcome {
            bundle_path: bundle_path.to_path_buf(),
            cache_hit: false,
            rows_written: merged.len(),
            files_written: written.len(),
            failed_symbols: failed,
        })
    }

    /// Whether the catalog already records a passed validation covering the
    /// requested range for this bundle.
    fn range_already_complete(&self, bundle: &str, job: &IngestJob) -> Result<bool> {
        let quality = self
            .catalog
            .latest_quality(bundle)
            .map_err(|e| self.catalog_err(bundle, e))?;
        let Some(quality) = quality else {
            return Ok(false);
        };
        let (Some(start), Some(end)) = (quality.start_date, quality.end_date) else {
            return Ok(false);
        };
        Ok(quality.validation_passed
            && quality.row_count > 0
            && start <= job.start.date_naive()
            && end >= job.end.date_naive())
    }
}

/// Deterministic checksum over the canonical content of a write: the
/// per-partition file checksums hashed in partition order.
fn combined_checksum(files: &[store::WrittenFile]) -> String {
    let mut sorted: Vec<&store::WrittenFile> = files.iter().collect();
    sorted.sort_by_key(|f| f.partition);
    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(file.checksum.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn dir_size(path: &Path) -> i64 {
    let mut total = 0i64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                stack.push(p);
            } else if let Ok(meta) = entry.metadata() {
                total += meta.len() as i64;
            }
        }
    }
    total
}
