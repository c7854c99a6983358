//! Service configuration.
//!
//! Loads `vela.toml` when present and falls back to defaults otherwise.
//! Everything here is optional overrides; the CLI's `--data-root` wins over
//! the file.
//!
//! ```toml
//! data_root = "data"
//! compression = "zstd"
//! partial_success = true
//!
//! [retry]
//! base_delay_ms = 500
//! max_attempts = 5
//! total_deadline_secs = 120
//!
//! [rate_limits.alphavantage]
//! tier = "free"
//! requests_per_minute = 5
//! requests_per_day = 500
//! quota_window = "calendar_utc"
//! ```

use adapter_service::{ProviderKey, QuotaWindow, RateLimitConfig, RateLimiter, RetryPolicy};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "vela.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VelaConfig {
    /// Root directory for bundles and the catalog.
    pub data_root: PathBuf,
    /// `zstd` (strong) or `snappy` (lightweight).
    pub compression: String,
    /// Keep going when individual symbols fail.
    pub partial_success: bool,
    pub retry: RetrySettings,
    /// Per-provider rate-limit overrides keyed by provider name.
    pub rate_limits: HashMap<String, RateLimitSettings>,
}

impl Default for VelaConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            compression: "zstd".to_string(),
            partial_success: true,
            retry: RetrySettings::default(),
            rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub total_deadline_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
            total_deadline_secs: policy.total_deadline.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    #[serde(default = "RateLimitSettings::default_tier")]
    pub tier: String,
    pub requests_per_minute: u32,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
    /// `calendar_utc` or `rolling_24h`.
    #[serde(default = "RateLimitSettings::default_window")]
    pub quota_window: String,
}

impl RateLimitSettings {
    fn default_tier() -> String {
        "default".to_string()
    }

    fn default_window() -> String {
        "calendar_utc".to_string()
    }
}

impl VelaConfig {
    /// Load from an explicit path, or from `vela.toml` in the working
    /// directory when it exists; defaults otherwise. An explicit path that
    /// does not exist is an error; the implicit one is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_FILE_NAME), false),
        };
        if !path.is_file() {
            if required {
                bail!("config file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: VelaConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        debug!(path = %path.display(), "config_loaded");
        Ok(config)
    }

    pub fn compression(&self) -> Result<store::BarCompression> {
        match self.compression.as_str() {
            "zstd" => Ok(store::BarCompression::Zstd),
            "snappy" => Ok(store::BarCompression::Snappy),
            other => bail!("unknown compression '{other}' (expected 'zstd' or 'snappy')"),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_attempts: self.retry.max_attempts,
            total_deadline: Duration::from_secs(self.retry.total_deadline_secs),
        }
    }

    /// Push configured per-provider overrides into a limiter. Providers not
    /// listed keep their adapter defaults.
    pub fn apply_rate_limits(&self, limiter: &RateLimiter) -> Result<()> {
        for (provider, settings) in &self.rate_limits {
            let window = match settings.quota_window.as_str() {
                "calendar_utc" => QuotaWindow::CalendarUtc,
                "rolling_24h" => QuotaWindow::Rolling24h,
                other => bail!("unknown quota window '{other}' for provider {provider}"),
            };
            let mut config = RateLimitConfig::per_minute(settings.requests_per_minute);
            config.quota_window = window;
            if let Some(cap) = settings.requests_per_day {
                config = config.with_daily_cap(cap);
            }
            limiter.configure(ProviderKey::new(provider.clone(), settings.tier.clone()), config);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_implicit_config_falls_back_to_defaults() {
        let config = VelaConfig::load(Some(Path::new("/no/such/vela.toml")));
        assert!(config.is_err());

        let config = VelaConfig::default();
        assert_eq!(config.data_root, PathBuf::from("data"));
        assert_eq!(config.compression, "zstd");
        assert!(config.partial_success);
    }

    #[test]
    fn config_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vela.toml");
        std::fs::write(
            &path,
            r#"
data_root = "/var/lib/vela"
compression = "snappy"
partial_success = false

[retry]
base_delay_ms = 100
max_attempts = 3
total_deadline_secs = 30

[rate_limits.alphavantage]
tier = "premium"
requests_per_minute = 75
requests_per_day = 1200
quota_window = "rolling_24h"
"#,
        )
        .unwrap();

        let config = VelaConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/var/lib/vela"));
        assert_eq!(
            config.compression().unwrap(),
            store::BarCompression::Snappy
        );
        assert!(!config.partial_success);
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.rate_limits["alphavantage"].requests_per_day, Some(1200));

        let limiter = RateLimiter::new();
        config.apply_rate_limits(&limiter).unwrap();
        assert!(limiter.check(&ProviderKey::new("alphavantage", "premium")));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vela.toml");
        std::fs::write(&path, "not_a_setting = true\n").unwrap();
        assert!(VelaConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn bad_compression_is_rejected() {
        let config = VelaConfig {
            compression: "brotli".to_string(),
            ..Default::default()
        };
        assert!(config.compression().is_err());
    }
}
