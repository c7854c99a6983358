//! # Vela Adapter Service
//!
//! Provider-agnostic market-data acquisition for the Vela data plane:
//! fetch OHLCV bars from heterogeneous providers, normalize them to the
//! canonical exact-decimal schema, and validate them before anything is
//! written.
//!
//! ## Architecture Role
//!
//! Adapters are the boundary between external provider wire formats and the
//! canonical bar schema. They are stateless transformers:
//!
//! - **Fetch**: rate-limited, retried, deadline-bounded HTTP (or file)
//!   reads. Suspension points are the rate-limiter token wait and socket
//!   I/O; every fetch is idempotent so the retry executor can re-run it.
//! - **Normalize**: wire strings become scale-8 decimals (never through
//!   binary floating point), timestamps become UTC instants, rows are
//!   sorted and deduplicated per symbol.
//! - **Validate**: OHLCV invariants are checked on the whole batch; one bad
//!   row blocks the batch.
//!
//! Adapters do NOT write files, touch the catalog, or assign sids - the
//! ingestion orchestrator owns those steps.
//!
//! ## Error Recovery
//!
//! Only `Network` and `RateLimited` errors are recovered, via
//! [`RetryPolicy`]; everything else propagates to the orchestrator, which
//! attributes the failure to the affected symbol and decides whether the
//! job continues.

pub mod common;
pub mod error;
pub mod live;
pub mod providers;
pub mod rate_limit;
pub mod retry;

pub use common::{normalize_rows, ApiCredentials, OhlcvSource};
pub use error::{AdapterError, Result};
pub use live::{BarAggregator, TradeTick};
pub use providers::{
    AlphaVantageAdapter, AvAssetClass, AvTier, CsvDirAdapter, ExchangeAdapter, PolygonAdapter,
    PolygonTier, ProviderSpec, SourceRegistry,
};
pub use rate_limit::{ProviderKey, QuotaWindow, RateLimitConfig, RateLimiter};
pub use retry::RetryPolicy;
