//! Provider adapter implementations.
//!
//! | Source | Wire shape | Auth | Notes |
//! |--------|-----------|------|-------|
//! | [`alphavantage`] | HTTP-JSON time series | query param | tiered rate limits |
//! | [`polygon`] | HTTP-JSON aggregates | bearer header | equities + crypto tickers |
//! | [`exchange`] | klines REST | optional header | unified over binance-compatible venues |
//! | [`csvdir`] | local CSV files | none | per-symbol files |

pub mod alphavantage;
pub mod csvdir;
pub mod exchange;
pub mod polygon;
pub mod registry;

pub use alphavantage::{AlphaVantageAdapter, AvAssetClass, AvTier};
pub use csvdir::CsvDirAdapter;
pub use exchange::ExchangeAdapter;
pub use polygon::{PolygonAdapter, PolygonTier};
pub use registry::{ProviderSpec, SourceRegistry};
