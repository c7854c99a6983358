//! Source registry: string name -> adapter constructor.
//!
//! The capability set is statically typed - each constructor returns an
//! `Arc<dyn OhlcvSource>` - while the registration table lets the CLI and
//! orchestrator resolve sources by name at startup.

use crate::common::OhlcvSource;
use crate::providers::alphavantage::{AlphaVantageAdapter, AvAssetClass, AvTier};
use crate::providers::csvdir::CsvDirAdapter;
use crate::providers::exchange::ExchangeAdapter;
use crate::providers::polygon::{PolygonAdapter, PolygonTier};
use crate::rate_limit::RateLimiter;
use crate::{AdapterError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a constructor may need to build a source.
#[derive(Debug, Clone, Default)]
pub struct ProviderSpec {
    /// Registered source name (`alphavantage`, `polygon`, `exchange`,
    /// `csv`).
    pub source: String,
    /// Subscription tier, when the provider has tiers.
    pub tier: Option<String>,
    /// Product family for multi-class providers (`stocks`, `forex`,
    /// `crypto`).
    pub asset_class: Option<String>,
    /// Exchange id for the unified exchange adapter.
    pub exchange_id: Option<String>,
    /// Directory for the CSV adapter.
    pub csv_dir: Option<PathBuf>,
}

type Constructor =
    Box<dyn Fn(&ProviderSpec, &RateLimiter) -> Result<Arc<dyn OhlcvSource>> + Send + Sync>;

/// Name-keyed constructor table, built once at startup.
pub struct SourceRegistry {
    table: BTreeMap<String, Constructor>,
}

impl SourceRegistry {
    /// Registry with every built-in source.
    pub fn builtin() -> Self {
        let mut registry = Self {
            table: BTreeMap::new(),
        };

        registry.register("alphavantage", |spec, limiter| {
            let tier = match spec.tier.as_deref() {
                Some("premium") => AvTier::Premium,
                _ => AvTier::Free,
            };
            let asset_class = match spec.asset_class.as_deref() {
                Some("forex") => AvAssetClass::Forex,
                Some("crypto") => AvAssetClass::Crypto,
                _ => AvAssetClass::Stocks,
            };
            let adapter = AlphaVantageAdapter::new(tier, asset_class, limiter.clone())?;
            Ok(Arc::new(adapter) as Arc<dyn OhlcvSource>)
        });

        registry.register("polygon", |spec, limiter| {
            let tier = match spec.tier.as_deref() {
                Some("starter") => PolygonTier::Starter,
                _ => PolygonTier::Free,
            };
            let adapter = PolygonAdapter::new(tier, limiter.clone())?;
            Ok(Arc::new(adapter) as Arc<dyn OhlcvSource>)
        });

        registry.register("exchange", |spec, limiter| {
            let exchange_id = spec.exchange_id.as_deref().ok_or_else(|| {
                AdapterError::InvalidRequest(
                    "the exchange source requires an exchange id".to_string(),
                )
            })?;
            let adapter = ExchangeAdapter::new(exchange_id, limiter.clone())?;
            Ok(Arc::new(adapter) as Arc<dyn OhlcvSource>)
        });

        registry.register("csv", |spec, _limiter| {
            let csv_dir = spec.csv_dir.as_ref().ok_or_else(|| {
                AdapterError::InvalidRequest("the csv source requires a directory".to_string())
            })?;
            let adapter = CsvDirAdapter::new(csv_dir)?;
            Ok(Arc::new(adapter) as Arc<dyn OhlcvSource>)
        });

        registry
    }

    /// Register (or replace) a constructor under a name.
    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&ProviderSpec, &RateLimiter) -> Result<Arc<dyn OhlcvSource>> + Send + Sync + 'static,
    {
        self.table.insert(name.to_string(), Box::new(ctor));
    }

    /// Build a source from a spec.
    pub fn create(&self, spec: &ProviderSpec, limiter: &RateLimiter) -> Result<Arc<dyn OhlcvSource>> {
        let ctor = self.table.get(&spec.source).ok_or_else(|| {
            AdapterError::InvalidRequest(format!(
                "unknown source '{}'; available: {}",
                spec.source,
                self.names().join(", ")
            ))
        })?;
        ctor(spec, limiter)
    }

    /// Registered source names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.table.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn builtin_registry_lists_all_sources() {
        let registry = SourceRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["alphavantage", "csv", "exchange", "polygon"]
        );
    }

    #[test]
    fn unknown_source_is_invalid_request() {
        let registry = SourceRegistry::builtin();
        let spec = ProviderSpec {
            source: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            registry.create(&spec, &RateLimiter::new()),
            Err(AdapterError::InvalidRequest(_))
        ));
    }

    #[test]
    fn csv_source_builds_from_spec() {
        let dir = tempdir().unwrap();
        let registry = SourceRegistry::builtin();
        let spec = ProviderSpec {
            source: "csv".to_string(),
            csv_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let source = registry.create(&spec, &RateLimiter::new()).unwrap();
        assert_eq!(source.name(), "csvdir");
    }

    #[test]
    fn exchange_source_requires_an_id() {
        let registry = SourceRegistry::builtin();
        let spec = ProviderSpec {
            source: "exchange".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            registry.create(&spec, &RateLimiter::new()),
            Err(AdapterError::InvalidRequest(_))
        ));
    }

    #[test]
    fn custom_sources_can_be_registered() {
        let mut registry = SourceRegistry::builtin();
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        registry.register("local", move |_spec, _limiter| {
            Ok(Arc::new(CsvDirAdapter::new(&path)?) as Arc<dyn OhlcvSource>)
        });
        let spec = ProviderSpec {
            source: "local".to_string(),
            ..Default::default()
        };
        assert!(registry.create(&spec, &RateLimiter::new()).is_ok());
    }
}
