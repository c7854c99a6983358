//! `vela` - market-data plane CLI.

use adapter_service::{ProviderSpec, RateLimiter, SourceRegistry};
use anyhow::{bail, Context};
use catalog::{migrate_legacy_catalog, needs_migration, Catalog, CATALOG_FILE_NAME};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use ingest_service::{FetchCache, IngestConfig, IngestError, IngestJob, Orchestrator, VelaConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use store::BarReader;
use tracing::info;
use types::{quality_report, Timeframe};

#[derive(Parser)]
#[command(name = "vela", version, about = "Vela market-data ingestion and bundle management")]
struct Cli {
    /// Root directory for bundles and the metadata catalog. Overrides the
    /// config file.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Configuration file (defaults to ./vela.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch bars from a source into a bundle.
    Ingest {
        /// Source name (alphavantage, polygon, exchange, csv).
        source: String,
        #[arg(short, long)]
        bundle: String,
        /// Comma-separated symbols, e.g. 'AAPL,MSFT' or 'BTC/USDT'.
        #[arg(long)]
        symbols: String,
        /// Start date, YYYY-MM-DD (inclusive).
        #[arg(long)]
        start: NaiveDate,
        /// End date, YYYY-MM-DD (inclusive).
        #[arg(long)]
        end: NaiveDate,
        /// Bar resolution.
        #[arg(long, default_value = "1d")]
        frequency: String,
        /// Exchange id for the exchange source.
        #[arg(long)]
        exchange: Option<String>,
        /// Directory for the csv source.
        #[arg(long)]
        csv_dir: Option<PathBuf>,
        /// Provider tier (free, premium, starter).
        #[arg(long)]
        tier: Option<String>,
        /// Provider asset class (stocks, forex, crypto).
        #[arg(long)]
        asset_class: Option<String>,
    },

    /// Inspect and validate bundles.
    Bundle {
        #[command(subcommand)]
        command: BundleCommand,
    },

    /// Inspect and clean the fetch cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand)]
enum BundleCommand {
    /// List all bundles with their latest quality.
    List,
    /// Show provenance and quality for one bundle.
    Info { name: String },
    /// Re-validate a bundle's stored bars and append a quality record.
    Validate { name: String },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Aggregate hit/miss statistics over a trailing window.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Evict least-recently-used entries down to a ceiling, or everything.
    Clean {
        /// Size ceiling, e.g. '4GB', '500MB'.
        #[arg(long, conflicts_with = "all")]
        max_size: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// List cache entries, least recently used first.
    List,
}

fn parse_size(value: &str) -> anyhow::Result<i64> {
    let value = value.trim().to_uppercase();
    let (number, multiplier) = if let Some(n) = value.strip_suffix("GB") {
        (n, 1_000_000_000i64)
    } else if let Some(n) = value.strip_suffix("MB") {
        (n, 1_000_000i64)
    } else if let Some(n) = value.strip_suffix("KB") {
        (n, 1_000i64)
    } else if let Some(n) = value.strip_suffix('B') {
        (n, 1i64)
    } else {
        (value.as_str(), 1i64)
    };
    let number: f64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid size '{value}'"))?;
    Ok((number * multiplier as f64) as i64)
}

fn open_catalog(data_root: &PathBuf) -> anyhow::Result<Catalog> {
    std::fs::create_dir_all(data_root)?;
    let db_path = data_root.join(CATALOG_FILE_NAME);
    if needs_migration(&db_path)? {
        let report = migrate_legacy_catalog(&db_path, data_root)?;
        info!(
            backup = %report.backup_dir.display(),
            bundles = report.bundle_count,
            "legacy catalog migrated"
        );
    }
    Ok(Catalog::open(db_path)?)
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest(
    config: &VelaConfig,
    data_root: PathBuf,
    source: String,
    bundle: String,
    symbols: String,
    start: NaiveDate,
    end: NaiveDate,
    frequency: String,
    exchange: Option<String>,
    csv_dir: Option<PathBuf>,
    tier: Option<String>,
    asset_class: Option<String>,
) -> anyhow::Result<()> {
    let timeframe = Timeframe::parse(&frequency).ok_or_else(|| {
        IngestError::InvalidArgument(format!("unknown frequency '{frequency}'"))
    })?;
    let symbols: Vec<String> = symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(IngestError::InvalidArgument(
            "--symbols must name at least one symbol".to_string(),
        )
        .into());
    }

    std::fs::create_dir_all(&data_root)?;
    let db_path = data_root.join(CATALOG_FILE_NAME);
    if needs_migration(&db_path)? {
        let report = migrate_legacy_catalog(&db_path, &data_root)?;
        info!(backup = %report.backup_dir.display(), "legacy catalog migrated");
    }

    let registry = SourceRegistry::builtin();
    let limiter = RateLimiter::new();
    let spec = ProviderSpec {
        source,
        tier,
        asset_class,
        exchange_id: exchange,
        csv_dir,
    };
    let adapter = registry.create(&spec, &limiter)?;
    // Config overrides land after construction so they win over adapter
    // defaults.
    config.apply_rate_limits(&limiter)?;

    let mut ingest_config = IngestConfig::new(&data_root);
    ingest_config.compression = config.compression()?;
    ingest_config.partial_success = config.partial_success;
    ingest_config.retry = config.retry_policy();
    let orchestrator = Orchestrator::open(ingest_config)?;
    let job = IngestJob {
        bundle: bundle.clone(),
        symbols,
        start: Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).expect("midnight")),
        end: Utc.from_utc_datetime(&end.and_hms_opt(23, 59, 59).expect("valid time")),
        timeframe,
    };

    let outcome = orchestrator.run(adapter, &job).await?;
    if outcome.cache_hit {
        println!(
            "bundle '{bundle}' already ingested (cache hit): {}",
            outcome.bundle_path.display()
        );
    } else {
        println!(
            "ingested {} rows into {} file(s) under {}",
            outcome.rows_written,
            outcome.files_written,
            outcome.bundle_path.display()
        );
    }
    for (symbol, reason) in &outcome.failed_symbols {
        eprintln!("warning: symbol {symbol} failed: {reason}");
    }
    Ok(())
}

fn run_bundle(data_root: PathBuf, command: BundleCommand) -> anyhow::Result<()> {
    let catalog = open_catalog(&data_root)?;
    match command {
        BundleCommand::List => {
            let bundles = catalog.list_bundles(None)?;
            if bundles.is_empty() {
                println!("no bundles");
                return Ok(());
            }
            for info in bundles {
                let (rows, range, passed) = match &info.quality {
                    Some(q) => (
                        q.row_count.to_string(),
                        format!(
                            "{} .. {}",
                            q.start_date.map(|d| d.to_string()).unwrap_or_default(),
                            q.end_date.map(|d| d.to_string()).unwrap_or_default()
                        ),
                        if q.validation_passed { "ok" } else { "FAILED" },
                    ),
                    None => ("-".to_string(), "-".to_string(), "-"),
                };
                println!(
                    "{:<24} {:<16} {:>10} rows  {:<26} {}",
                    info.bundle_name, info.provenance.source_type, rows, range, passed
                );
            }
        }
        BundleCommand::Info { name } => {
            let info = catalog.require_bundle(&name)?;
            println!("bundle:     {}", info.bundle_name);
            println!("source:     {}", info.provenance.source_type);
            if let Some(url) = &info.provenance.source_url {
                println!("url:        {url}");
            }
            if let Some(version) = &info.provenance.api_version {
                println!("api:        {version}");
            }
            println!("checksum:   {}", info.provenance.checksum);
            println!("fetched:    {}", info.provenance.fetch_timestamp);
            println!("timezone:   {}", info.provenance.timezone);
            if let Some(q) = &info.quality {
                println!("rows:       {}", q.row_count);
                println!(
                    "range:      {} .. {}",
                    q.start_date.map(|d| d.to_string()).unwrap_or_default(),
                    q.end_date.map(|d| d.to_string()).unwrap_or_default()
                );
                println!("missing:    {} day(s)", q.missing_days_count);
                println!("outliers:   {}", q.outlier_count);
                println!("violations: {}", q.ohlcv_violations);
                println!(
                    "validation: {}",
                    if q.validation_passed { "passed" } else { "FAILED" }
                );
            }
            let symbols = catalog.symbols(&name)?;
            if !symbols.is_empty() {
                let names: Vec<String> = symbols
                    .iter()
                    .map(|s| format!("{} (sid {})", s.symbol, s.sid))
                    .collect();
                println!("symbols:    {}", names.join(", "));
            }
        }
        BundleCommand::Validate { name } => {
            let info = catalog.require_bundle(&name)?;
            let bundle_path = data_root.join(&name);
            if !bundle_path.exists() {
                bail!("bundle '{name}' has no files under {}", bundle_path.display());
            }
            println!(
                "validating bundle '{}' (source {}, fetched {})",
                info.bundle_name, info.provenance.source_type, info.provenance.fetch_timestamp
            );

            // Re-read everything the store holds for this bundle.
            let reader = BarReader::new(&bundle_path);
            let full_start = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
            let full_end = Utc::now().date_naive();
            let daily = reader.load_daily(&[], full_start, full_end)?;
            let minute = reader.load_minute(
                &[],
                Utc.from_utc_datetime(&full_start.and_hms_opt(0, 0, 0).expect("midnight")),
                Utc::now(),
            )?;
            let (batch, timeframe) = if daily.is_empty() {
                (minute, Timeframe::M1)
            } else {
                (daily, Timeframe::D1)
            };

            let report = quality_report(&batch, timeframe);
            catalog.record_quality(
                &name,
                &catalog::Quality::from_report(&report, Utc::now().timestamp()),
            )?;
            println!(
                "bundle '{}': {} rows, {} violation(s), {} outlier(s), {} missing day(s)",
                name,
                report.total_rows,
                report.ohlcv_violations,
                report.outlier_count,
                report.missing_days.len()
            );
            if !report.passed {
                bail!("validation failed for bundle '{name}'");
            }
            println!("validation passed");
        }
    }
    Ok(())
}

fn run_cache(data_root: PathBuf, command: CacheCommand) -> anyhow::Result<()> {
    let catalog = open_catalog(&data_root)?;
    let cache = FetchCache::new(&catalog);
    match command {
        CacheCommand::Stats { days } => {
            let stats = cache.stats(days)?;
            println!("window:        {} day(s)", stats.days);
            println!("hits:          {}", stats.hit_count);
            println!("misses:        {}", stats.miss_count);
            println!("hit rate:      {:.1}%", stats.hit_rate * 100.0);
            println!("total size:    {} bytes", stats.total_size_bytes);
            println!("avg latency:   {:.1} ms", stats.avg_fetch_latency_ms);
        }
        CacheCommand::Clean { max_size, all } => {
            if all {
                let count = cache.clean_all()?;
                println!("evicted {count} cache entr(y/ies)");
            } else if let Some(size) = max_size {
                let ceiling = parse_size(&size)?;
                let evicted = cache.clean_max_size(ceiling)?;
                let freed: i64 = evicted.iter().map(|e| e.size_bytes).sum();
                println!(
                    "evicted {} entr(y/ies), freed {} bytes, cache now {} bytes",
                    evicted.len(),
                    freed,
                    catalog.cache_total_size()?
                );
            } else {
                return Err(IngestError::InvalidArgument(
                    "cache clean requires --max-size SIZE or --all".to_string(),
                )
                .into());
            }
        }
        CacheCommand::List => {
            let entries = cache.entries()?;
            if entries.is_empty() {
                println!("cache is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{:<18} {:>14} bytes  last used {}  {}",
                    &entry.cache_key[..16.min(entry.cache_key.len())],
                    entry.size_bytes,
                    entry.last_accessed,
                    entry.bundle_name
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match VelaConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(1);
        }
    };
    let data_root = cli.data_root.unwrap_or_else(|| config.data_root.clone());

    let result = match cli.command {
        Command::Ingest {
            source,
            bundle,
            symbols,
            start,
            end,
            frequency,
            exchange,
            csv_dir,
            tier,
            asset_class,
        } => {
            run_ingest(
                &config,
                data_root,
                source,
                bundle,
                symbols,
                start,
                end,
                frequency,
                exchange,
                csv_dir,
                tier,
                asset_class,
            )
            .await
        }
        Command::Bundle { command } => run_bundle(data_root, command),
        Command::Cache { command } => run_cache(data_root, command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
