//! Fetch cache over the catalog's `bundle_cache` and `cache_stats_daily`
//! tables.
//!
//! The cache key is a deterministic hash of everything that shapes a fetch
//! result: source name, provider configuration, order-normalized symbols,
//! range, and resolution. A hit binds directly to on-disk bar files; a miss
//! is recorded after the adapter -> writer pipeline completes.

use crate::error::{IngestError, Result};
use catalog::{CacheEntry, Catalog};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info, warn};
use types::Timeframe;

/// Non-owning cache handle; borrows the catalog for the duration of a call.
pub struct FetchCache<'a> {
    catalog: &'a Catalog,
}

/// Aggregated view over a trailing stats window.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatsSummary {
    pub days: u32,
    pub hit_count: i64,
    pub miss_count: i64,
    pub hit_rate: f64,
    /// Latest recorded cache size in the window.
    pub total_size_bytes: i64,
    /// Lookup-weighted average fetch latency.
    pub avg_fetch_latency_ms: f64,
}

impl<'a> FetchCache<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Deterministic cache key for one fetch shape. Symbols are sorted so
    /// `A,B` and `B,A` share an entry.
    pub fn key(
        source: &str,
        provider_config: &str,
        symbols: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> String {
        let mut sorted: Vec<&str> = symbols.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update(b"|");
        hasher.update(provider_config.as_bytes());
        hasher.update(b"|");
        hasher.update(sorted.join(",").as_bytes());
        hasher.update(b"|");
        hasher.update(start.timestamp_micros().to_le_bytes());
        hasher.update(end.timestamp_micros().to_le_bytes());
        hasher.update(timeframe.label().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn catalog_err(&self, bundle: &str, source: catalog::CatalogError) -> IngestError {
        IngestError::Catalog {
            bundle: bundle.to_string(),
            source,
        }
    }

    /// Look the key up. A hit touches `last_accessed` and counts toward the
    /// daily hit counter with zero latency. A catalog row whose files are
    /// gone is dangling: it is dropped and reported as a miss so the job
    /// re-ingests.
    pub fn lookup(&self, bundle: &str, cache_key: &str) -> Result<Option<CacheEntry>> {
        let entry = self
            .catalog
            .cache_entry(cache_key)
            .map_err(|e| self.catalog_err(bundle, e))?;
        let Some(entry) = entry else {
            return Ok(None);
        };

        if !Path::new(&entry.bundle_path).exists() {
            warn!(
                cache_key,
                path = %entry.bundle_path,
                "dangling_cache_entry_purged"
            );
            self.catalog
                .evict_cache_entry(cache_key, |_| Ok(()))
                .map_err(|e| self.catalog_err(bundle, e))?;
            return Ok(None);
        }

        self.catalog
            .touch_cache_entry(cache_key)
            .map_err(|e| self.catalog_err(bundle, e))?;
        self.catalog
            .bump_cache_hit()
            .map_err(|e| self.catalog_err(bundle, e))?;
        debug!(cache_key, bundle, "cache_hit");
        Ok(Some(entry))
    }

    /// Record a completed miss: insert the entry, then snapshot the total
    /// cache size into today's stats row together with the measured fetch
    /// latency.
    pub fn record(
        &self,
        bundle: &str,
        cache_key: &str,
        bundle_path: &str,
        size_bytes: i64,
        fetch_latency_ms: f64,
    ) -> Result<()> {
        self.catalog
            .insert_cache_entry(cache_key, bundle, bundle_path, size_bytes)
            .map_err(|e| self.catalog_err(bundle, e))?;
        let total = self
            .catalog
            .cache_total_size()
            .map_err(|e| self.catalog_err(bundle, e))?;
        self.catalog
            .bump_cache_miss(fetch_latency_ms, total)
            .map_err(|e| self.catalog_err(bundle, e))?;
        debug!(cache_key, bundle, size_bytes, "cache_miss_recorded");
        Ok(())
    }

    /// All entries, least recently used first.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.catalog
            .cache_entries_by_lru()
            .map_err(|e| self.catalog_err("", e))
    }

    /// Evict in ascending `last_accessed` order until the total size is at
    /// or under `ceiling_bytes`. Stats counters are left intact. Returns the
    /// evicted entries.
    pub fn clean_max_size(&self, ceiling_bytes: i64) -> Result<Vec<CacheEntry>> {
        let mut total = self
            .catalog
            .cache_total_size()
            .map_err(|e| self.catalog_err("", e))?;
        let mut evicted = Vec::new();
        if total <= ceiling_bytes {
            return Ok(evicted);
        }

        let entries = self.entries()?;
        for entry in entries {
            if total <= ceiling_bytes {
                break;
            }
            self.evict(&entry)?;
            total -= entry.size_bytes;
            evicted.push(entry);
        }

        info!(
            evicted = evicted.len(),
            remaining_bytes = total,
            ceiling_bytes,
            "cache_cleaned_to_ceiling"
        );
        Ok(evicted)
    }

    /// Remove every entry and its files.
    pub fn clean_all(&self) -> Result<usize> {
        let entries = self.entries()?;
        let count = entries.len();
        for entry in &entries {
            self.evict(entry)?;
        }
        info!(evicted = count, "cache_cleaned_all");
        Ok(count)
    }

    fn evict(&self, entry: &CacheEntry) -> Result<()> {
        // Multiple ranges of one bundle share a bundle directory; the file
        // tree goes only when the last entry pointing at it goes.
        let shared = self
            .entries()?
            .iter()
            .filter(|other| other.bundle_path == entry.bundle_path)
            .count()
            > 1;

        self.catalog
            .evict_cache_entry(&entry.cache_key, |entry| {
                let path = Path::new(&entry.bundle_path);
                if !shared && path.exists() {
                    std::fs::remove_dir_all(path)?;
                }
                Ok(())
            })
            .map_err(|e| self.catalog_err(&entry.bundle_name, e))?;
        Ok(())
    }

    /// Aggregate the trailing stats window.
    pub fn stats(&self, days: u32) -> Result<CacheStatsSummary> {
        let window = self
            .catalog
            .cache_stats_window(days)
            .map_err(|e| self.catalog_err("", e))?;

        let mut hit_count = 0i64;
        let mut miss_count = 0i64;
        let mut weighted_latency = 0.0f64;
        let mut total_size_bytes = 0i64;
        for day in &window {
            hit_count += day.hit_count;
            miss_count += day.miss_count;
            weighted_latency +=
                day.avg_fetch_latency_ms * (day.hit_count + day.miss_count) as f64;
            total_size_bytes = day.total_size_bytes;
        }
        let lookups = hit_count + miss_count;

        Ok(CacheStatsSummary {
            days,
            hit_count,
            miss_count,
            hit_rate: if lookups > 0 {
                hit_count as f64 / lookups as f64
            } else {
                0.0
            },
            total_size_bytes,
            avg_fetch_latency_ms: if lookups > 0 {
                weighted_latency / lookups as f64
            } else {
                0.0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn keys_are_deterministic_and_symbol_order_free() {
        let a = FetchCache::key(
            "exchange_binance",
            "exchange_id=binance",
            &["BTC/USDT".into(), "ETH/USDT".into()],
            ts(1),
            ts(7),
            Timeframe::H1,
        );
        let b = FetchCache::key(
            "exchange_binance",
            "exchange_id=binance",
            &["ETH/USDT".into(), "BTC/USDT".into()],
            ts(1),
            ts(7),
            Timeframe::H1,
        );
        let c = FetchCache::key(
            "exchange_binance",
            "exchange_id=binance",
            &["BTC/USDT".into()],
            ts(1),
            ts(7),
            Timeframe::H1,
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn lookup_purges_dangling_entries() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in(dir.path()).unwrap();
        let cache = FetchCache::new(&catalog);

        catalog
            .insert_cache_entry("k", "b", "/no/such/path", 10)
            .unwrap();
        assert!(cache.lookup("b", "k").unwrap().is_none());
        assert!(catalog.cache_entry("k").unwrap().is_none());
    }

    #[test]
    fn hit_touches_and_counts() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in(dir.path()).unwrap();
        let cache = FetchCache::new(&catalog);

        let bundle_dir = dir.path().join("bundle");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        cache
            .record("b", "k", bundle_dir.to_str().unwrap(), 128, 250.0)
            .unwrap();

        let entry = cache.lookup("b", "k").unwrap().unwrap();
        assert_eq!(entry.size_bytes, 128);

        let summary = cache.stats(7).unwrap();
        assert_eq!(summary.hit_count, 1);
        assert_eq!(summary.miss_count, 1);
        assert_eq!(summary.total_size_bytes, 128);
        assert!((summary.hit_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn lru_eviction_stops_at_ceiling() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in(dir.path()).unwrap();
        let cache = FetchCache::new(&catalog);

        // Three entries, oldest first: 3 GB, 2 GB, 1 GB.
        let gb = 1_000_000_000i64;
        for (key, size) in [("old", 3 * gb), ("mid", 2 * gb), ("new", gb)] {
            let path = dir.path().join(key);
            std::fs::create_dir_all(&path).unwrap();
            catalog
                .insert_cache_entry(key, key, path.to_str().unwrap(), size)
                .unwrap();
            // Distinct last_accessed stamps in insertion order.
            std::thread::sleep(std::time::Duration::from_millis(1100));
            catalog.touch_cache_entry(key).unwrap();
        }

        let evicted = cache.clean_max_size(4 * gb).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].cache_key, "old");
        assert_eq!(catalog.cache_total_size().unwrap(), 3 * gb);
        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("mid").exists());
    }

    #[test]
    fn shared_bundle_path_survives_partial_eviction() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in(dir.path()).unwrap();
        let cache = FetchCache::new(&catalog);

        let shared = dir.path().join("bundle");
        std::fs::create_dir_all(&shared).unwrap();
        catalog
            .insert_cache_entry("k1", "b", shared.to_str().unwrap(), 10)
            .unwrap();
        catalog
            .insert_cache_entry("k2", "b", shared.to_str().unwrap(), 10)
            .unwrap();

        cache.clean_max_size(10).unwrap();
        // One row evicted, but the files are still referenced by the other.
        assert!(shared.exists());
        assert_eq!(cache.entries().unwrap().len(), 1);

        cache.clean_all().unwrap();
        assert!(!shared.exists());
    }

    #[test]
    fn clean_under_ceiling_is_a_no_op() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open_in(dir.path()).unwrap();
        let cache = FetchCache::new(&catalog);
        let path = dir.path().join("bundle");
        std::fs::create_dir_all(&path).unwrap();
        catalog
            .insert_cache_entry("k", "b", path.to_str().unwrap(), 100)
            .unwrap();

        assert!(cache.clean_max_size(1000).unwrap().is_empty());
        assert!(path.exists());
    }
}
