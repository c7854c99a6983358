//! End-to-end ingestion scenarios: orchestrator state machine, cache
//! behavior, and read-back through the portal.

use adapter_service::{AdapterError, OhlcvSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ingest_service::{IngestConfig, IngestJob, Orchestrator};
use portal::{DataPortal, Resolution};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use store::BarReader;
use tempfile::tempdir;
use types::{Asset, BarBatch, BarField, BarRow, Timeframe};

/// Scripted in-memory source: deterministic daily bars, a call counter,
/// and optional per-symbol failures.
struct ScriptedSource {
    calls: AtomicU32,
    days: Vec<u32>,
    base_close: Decimal,
    missing_symbols: Vec<String>,
    corrupt: bool,
}

impl ScriptedSource {
    fn new(days: Vec<u32>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            days,
            base_close: dec!(100.50),
            missing_symbols: Vec::new(),
            corrupt: false,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OhlcvSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn provider_config(&self) -> String {
        "fixture=v1".to_string()
    }

    fn source_url(&self) -> String {
        "memory://scripted".to_string()
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _timeframe: Timeframe,
    ) -> adapter_service::Result<BarBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.missing_symbols.iter().any(|s| s == symbol) {
            return Err(AdapterError::SymbolNotFound {
                provider: "scripted".to_string(),
                symbol: symbol.to_string(),
            });
        }

        let rows: Vec<BarRow> = self
            .days
            .iter()
            .map(|day| {
                let close = self.base_close + Decimal::from(2 * (day - 1));
                let (high, low) = if self.corrupt {
                    (close - dec!(50), close + dec!(50)) // high < low
                } else {
                    (close + dec!(1), close - dec!(1))
                };
                BarRow {
                    ts: Utc.with_ymd_and_hms(2023, 1, *day, 0, 0, 0).unwrap(),
                    sid: 0,
                    open: close,
                    high,
                    low,
                    close,
                    volume: dec!(1000),
                }
            })
            .filter(|row| row.ts >= start && row.ts <= end)
            .collect();
        Ok(BarBatch::from_rows(rows))
    }
}

fn job(bundle: &str, symbols: &[&str]) -> IngestJob {
    IngestJob {
        bundle: bundle.to_string(),
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        start: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2023, 1, 7, 23, 59, 59).unwrap(),
        timeframe: Timeframe::D1,
    }
}

#[tokio::test]
async fn cold_ingest_writes_and_catalogs() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let source = Arc::new(ScriptedSource::new(vec![1, 2, 3]));

    let outcome = orchestrator
        .run(source.clone(), &job("daily-demo", &["AAPL"]))
        .await
        .unwrap();

    assert!(!outcome.cache_hit);
    assert_eq!(outcome.rows_written, 3);
    assert_eq!(source.calls(), 1);

    // Catalog truth: provenance, quality, symbol, cache entry.
    let catalog = orchestrator.catalog();
    let info = catalog.bundle("daily-demo").unwrap().unwrap();
    assert_eq!(info.provenance.source_type, "scripted");
    assert_eq!(info.provenance.checksum.len(), 64);
    let quality = info.quality.unwrap();
    assert!(quality.validation_passed);
    assert_eq!(quality.row_count, 3);
    assert_eq!(catalog.symbols("daily-demo").unwrap().len(), 1);

    // Stored row count matches the catalog's row count.
    let reader = BarReader::new(outcome.bundle_path);
    let stored = reader
        .load_daily(
            &[],
            chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            chrono::NaiveDate::from_ymd_opt(2023, 1, 31).unwrap(),
        )
        .unwrap();
    assert_eq!(stored.len() as i64, quality.row_count);
}

#[tokio::test]
async fn warm_cache_performs_no_adapter_calls() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let source = Arc::new(ScriptedSource::new(vec![1, 2, 3, 4, 5, 6, 7]));
    let job = job("crypto-hourly", &["BTC/USDT"]);

    let first = orchestrator.run(source.clone(), &job).await.unwrap();
    assert!(!first.cache_hit);
    let calls_after_cold = source.calls();

    let second = orchestrator.run(source.clone(), &job).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(source.calls(), calls_after_cold);
    assert_eq!(first.bundle_path, second.bundle_path);
}

#[tokio::test]
async fn re_ingest_into_fresh_roots_yields_identical_checksums() {
    let source = Arc::new(ScriptedSource::new(vec![1, 2, 3]));
    let mut checksums = Vec::new();

    for _ in 0..2 {
        let root = tempdir().unwrap();
        let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
        orchestrator
            .run(source.clone(), &job("repeat", &["AAPL"]))
            .await
            .unwrap();
        let info = orchestrator.catalog().bundle("repeat").unwrap().unwrap();
        checksums.push(info.provenance.checksum);
    }

    assert_eq!(checksums[0], checksums[1]);
}

#[tokio::test]
async fn validation_failure_leaves_no_file_and_no_catalog_row() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let mut source = ScriptedSource::new(vec![1, 2]);
    source.corrupt = true;

    let err = orchestrator
        .run(Arc::new(source), &job("broken", &["AAPL"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ingest_service::IngestError::Store { .. }));

    // No bundle directory, no provenance row, no symbol rows, no cache
    // entry.
    assert!(!root.path().join("broken").exists());
    let catalog = orchestrator.catalog();
    assert!(catalog.bundle("broken").unwrap().is_none());
    assert!(catalog.symbols("broken").unwrap().is_empty());
    assert!(catalog.cache_entries_by_lru().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_symbols_do_not_fail_the_job() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let mut source = ScriptedSource::new(vec![1, 2, 3]);
    source.missing_symbols.push("GHOST".to_string());

    let outcome = orchestrator
        .run(Arc::new(source), &job("mixed", &["AAPL", "GHOST"]))
        .await
        .unwrap();

    assert_eq!(outcome.rows_written, 3);
    assert_eq!(outcome.failed_symbols.len(), 1);
    assert_eq!(outcome.failed_symbols[0].0, "GHOST");
    // Only the symbol that delivered data was cataloged.
    let symbols = orchestrator.catalog().symbols("mixed").unwrap();
    assert_eq!(symbols.len(), 1);
    assert_eq!(symbols[0].symbol, "AAPL");
}

#[tokio::test]
async fn all_symbols_failing_fails_the_job() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let mut source = ScriptedSource::new(vec![1]);
    source.missing_symbols = vec!["A".to_string(), "B".to_string()];

    let err = orchestrator
        .run(Arc::new(source), &job("empty", &["A", "B"]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ingest_service::IngestError::AllSymbolsFailed { count: 2, .. }
    ));
}

#[tokio::test]
async fn empty_window_writes_nothing_and_catalogs_nothing() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    // Source has data only for January; the job asks for a later window.
    let source = Arc::new(ScriptedSource::new(vec![1, 2, 3]));
    let mut job = job("sparse", &["AAPL"]);
    job.start = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
    job.end = Utc.with_ymd_and_hms(2023, 6, 30, 23, 59, 59).unwrap();

    let outcome = orchestrator.run(source, &job).await.unwrap();
    assert_eq!(outcome.rows_written, 0);
    assert!(orchestrator.catalog().bundle("sparse").unwrap().is_none());
}

#[tokio::test]
async fn ingested_bundle_reads_back_through_the_portal() {
    let root = tempdir().unwrap();
    let orchestrator = Orchestrator::open(IngestConfig::new(root.path())).unwrap();
    let source = Arc::new(ScriptedSource::new(vec![1, 2, 3]));

    let outcome = orchestrator
        .run(source, &job("portal-demo", &["AAPL"]))
        .await
        .unwrap();
    let sid = orchestrator
        .catalog()
        .symbol_sid("portal-demo", "AAPL")
        .unwrap()
        .unwrap();

    let mut portal = DataPortal::new(
        Some(BarReader::new(&outcome.bundle_path)),
        None,
        Some(Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap()),
    )
    .unwrap();
    let assets = [Asset::new(sid, "AAPL")];

    // Spot at the simulation frontier: close for day 2 is 100.50 + 2.
    let spot = portal
        .spot(
            &assets,
            BarField::Close,
            Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
            Resolution::Daily,
        )
        .unwrap();
    assert_eq!(spot, vec![(sid, dec!(102.50))]);

    // Day 3 is in the future of the simulation clock.
    let err = portal
        .spot(
            &assets,
            BarField::Close,
            Utc.with_ymd_and_hms(2023, 1, 3, 0, 0, 0).unwrap(),
            Resolution::Daily,
        )
        .unwrap_err();
    assert!(matches!(err, portal::PortalError::Lookahead { .. }));

    // Advance and take a two-bar history window, ascending.
    portal
        .set_simulation_time(Utc.with_ymd_and_hms(2023, 1, 3, 0, 0, 0).unwrap())
        .unwrap();
    let history = portal
        .history(
            &assets,
            Utc.with_ymd_and_hms(2023, 1, 3, 0, 0, 0).unwrap(),
            2,
            BarField::Close,
            Resolution::Daily,
        )
        .unwrap();
    let closes: Vec<Decimal> = history.iter().map(|p| p.value).collect();
    assert_eq!(closes, vec![dec!(102.50), dec!(104.50)]);
}
