//! Alpha Vantage adapter for stocks, forex, and crypto.
//!
//! Query-parameter authentication (`apikey=`), tier-specific rate limits,
//! and the provider's three response key formats. API documentation:
//! <https://www.alphavantage.co/documentation/>

use crate::common::{
    classify_status, normalize_rows, transport_error, wire_text, ApiCredentials, OhlcvSource,
};
use crate::rate_limit::{ProviderKey, RateLimitConfig, RateLimiter};
use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use types::{decimal_from_wire, BarBatch, BarRow, Timeframe};

const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

/// Subscription tier; decides the rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvTier {
    /// 5 requests/minute, 500 requests/day.
    Free,
    /// 75 requests/minute, 1200 requests/day.
    Premium,
}

impl AvTier {
    fn label(&self) -> &'static str {
        match self {
            AvTier::Free => "free",
            AvTier::Premium => "premium",
        }
    }

    fn limits(&self) -> RateLimitConfig {
        match self {
            AvTier::Free => RateLimitConfig::per_minute(5).with_daily_cap(500),
            AvTier::Premium => RateLimitConfig::per_minute(75).with_daily_cap(1200),
        }
    }
}

/// Which Alpha Vantage product family to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvAssetClass {
    Stocks,
    Forex,
    Crypto,
}

impl AvAssetClass {
    fn label(&self) -> &'static str {
        match self {
            AvAssetClass::Stocks => "stocks",
            AvAssetClass::Forex => "forex",
            AvAssetClass::Crypto => "crypto",
        }
    }
}

/// Timeframe mapping (canonical label -> Alpha Vantage interval).
const INTRADAY_INTERVALS: [(Timeframe, &str); 5] = [
    (Timeframe::M1, "1min"),
    (Timeframe::M5, "5min"),
    (Timeframe::M15, "15min"),
    (Timeframe::M30, "30min"),
    (Timeframe::H1, "60min"),
];

pub struct AlphaVantageAdapter {
    name: String,
    asset_class: AvAssetClass,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimiter,
    limiter_key: ProviderKey,
}

impl AlphaVantageAdapter {
    /// Build an adapter with credentials from `ALPHAVANTAGE_API_KEY`.
    /// A missing key is fatal here, not at fetch time.
    pub fn new(tier: AvTier, asset_class: AvAssetClass, rate_limiter: RateLimiter) -> Result<Self> {
        let credentials = ApiCredentials::from_env("alphavantage", "ALPHAVANTAGE")?;
        Ok(Self::with_credentials(
            tier,
            asset_class,
            rate_limiter,
            credentials.api_key,
            DEFAULT_BASE_URL.to_string(),
        ))
    }

    /// Test seam: explicit credentials and endpoint.
    pub fn with_credentials(
        tier: AvTier,
        asset_class: AvAssetClass,
        rate_limiter: RateLimiter,
        api_key: String,
        base_url: String,
    ) -> Self {
        let name = format!("alphavantage_{}_{}", asset_class.label(), tier.label());
        let limiter_key = ProviderKey::new("alphavantage", tier.label());
        rate_limiter.configure(limiter_key.clone(), tier.limits());
        Self {
            name,
            asset_class,
            api_key,
            base_url,
            client: reqwest::Client::new(),
            rate_limiter,
            limiter_key,
        }
    }

    fn function_name(&self, timeframe: Timeframe) -> &'static str {
        let intraday = timeframe.is_intraday();
        match self.asset_class {
            AvAssetClass::Stocks => {
                if intraday {
                    "TIME_SERIES_INTRADAY"
                } else {
                    "TIME_SERIES_DAILY"
                }
            }
            AvAssetClass::Forex => {
                if intraday {
                    "FX_INTRADAY"
                } else {
                    "FX_DAILY"
                }
            }
            AvAssetClass::Crypto => {
                if intraday {
                    "CRYPTO_INTRADAY"
                } else {
                    "DIGITAL_CURRENCY_DAILY"
                }
            }
        }
    }

    fn symbol_params(&self, symbol: &str) -> Result<Vec<(String, String)>> {
        match self.asset_class {
            AvAssetClass::Stocks => Ok(vec![("symbol".into(), symbol.to_uppercase())]),
            AvAssetClass::Forex => {
                let upper = symbol.to_uppercase();
                let Some((from, to)) = upper.split_once('/') else {
                    return Err(AdapterError::InvalidRequest(format!(
                        "forex symbol must be 'XXX/YYY', got '{symbol}'"
                    )));
                };
                Ok(vec![
                    ("from_symbol".into(), from.to_string()),
                    ("to_symbol".into(), to.to_string()),
                ])
            }
            AvAssetClass::Crypto => Ok(vec![
                ("symbol".into(), symbol.to_uppercase()),
                ("market".into(), "USD".into()),
            ]),
        }
    }

    fn parse_time_series(
        &self,
        data: &Value,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BarRow>> {
        let Some(object) = data.as_object() else {
            return Err(self.parse_error("response is not a JSON object"));
        };
        let series = object
            .iter()
            .find(|(key, _)| {
                key.contains("Time Series") || key.contains("Digital Currency") || key.contains("FX")
            })
            .map(|(_, value)| value);
        let Some(Value::Object(series)) = series else {
            return Err(self.parse_error(&format!("no time series data for {symbol}")));
        };

        let mut rows = Vec::new();
        for (stamp, values) in series {
            let ts = parse_timestamp(stamp)
                .ok_or_else(|| self.parse_error(&format!("unparseable timestamp '{stamp}'")))?;
            if ts < start || ts > end {
                continue;
            }
            rows.push(self.parse_entry(ts, values)?);
        }
        Ok(rows)
    }

    fn parse_entry(&self, ts: DateTime<Utc>, values: &Value) -> Result<BarRow> {
        // Alpha Vantage varies its key format by product family.
        let key_sets = [
            ["1. open", "2. high", "3. low", "4. close", "5. volume"],
            [
                "1a. open (USD)",
                "2a. high (USD)",
                "3a. low (USD)",
                "4a. close (USD)",
                "5. volume",
            ],
            [
                "1b. open (USD)",
                "2b. high (USD)",
                "3b. low (USD)",
                "4b. close (USD)",
                "5. volume",
            ],
        ];
        let keys = key_sets
            .iter()
            .find(|set| values.get(set[0]).is_some())
            .ok_or_else(|| {
                self.parse_error(&format!(
                    "unknown response key format; available: {:?}",
                    values
                        .as_object()
                        .map(|o| o.keys().cloned().collect::<Vec<_>>())
                        .unwrap_or_default()
                ))
            })?;

        let field = |key: &str, default_zero: bool| -> Result<rust_decimal::Decimal> {
            let text = match values.get(key).and_then(wire_text) {
                Some(text) => text,
                None if default_zero => "0".to_string(),
                None => return Err(self.parse_error(&format!("missing field '{key}'"))),
            };
            decimal_from_wire(&text)
                .map_err(|e| self.parse_error(&format!("bad decimal in '{key}': {e}")))
        };

        Ok(BarRow {
            ts,
            sid: 0,
            open: field(keys[0], false)?,
            high: field(keys[1], false)?,
            low: field(keys[2], false)?,
            close: field(keys[3], false)?,
            volume: field(keys[4], true)?,
        })
    }

    fn parse_error(&self, detail: &str) -> AdapterError {
        AdapterError::Parse {
            provider: self.name.clone(),
            detail: detail.to_string(),
        }
    }
}

fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[async_trait]
impl OhlcvSource for AlphaVantageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_config(&self) -> String {
        format!("asset_class={}", self.asset_class.label())
    }

    fn source_url(&self) -> String {
        self.base_url.clone()
    }

    fn api_version(&self) -> Option<String> {
        Some("v1".to_string())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarBatch> {
        let mut params: Vec<(String, String)> = vec![
            ("function".into(), self.function_name(timeframe).into()),
            ("outputsize".into(), "full".into()),
            ("apikey".into(), self.api_key.clone()),
        ];
        params.extend(self.symbol_params(symbol)?);
        if timeframe.is_intraday() {
            let interval =
                crate::common::map_timeframe(&self.name, timeframe, &INTRADAY_INTERVALS)?;
            params.push(("interval".into(), interval.to_string()));
        }

        self.rate_limiter.acquire(&self.limiter_key).await?;

        let response = self
            .client
            .get(&self.base_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        if let Some(err) = classify_status(&self.name, response.status()) {
            return Err(err);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| self.parse_error(&format!("invalid JSON: {e}")))?;

        // The provider reports errors inside a 200 body.
        if let Some(message) = data.get("Error Message").and_then(Value::as_str) {
            if message.contains("Invalid API call") || message.to_lowercase().contains("not found")
            {
                return Err(AdapterError::SymbolNotFound {
                    provider: self.name.clone(),
                    symbol: symbol.to_string(),
                });
            }
            return Err(self.parse_error(&format!("provider error: {message}")));
        }
        if let Some(note) = data.get("Note").and_then(Value::as_str) {
            if note.contains("call frequency") || note.contains("per minute") {
                return Err(AdapterError::RateLimited {
                    provider: self.name.clone(),
                    retry_after: Some(Duration::from_secs(60)),
                });
            }
            return Err(AdapterError::QuotaExceeded {
                provider: self.name.clone(),
                limit: 0,
            });
        }

        let rows = self.parse_time_series(&data, symbol, start, end)?;
        debug!(
            provider = %self.name,
            symbol,
            rows = rows.len(),
            timeframe = %timeframe,
            "ohlcv_fetched"
        );
        normalize_rows(&self.name, rows)
    }
}
