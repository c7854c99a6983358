//! Polygon.io adapter for historical equities (and crypto) aggregates.
//!
//! Bearer-token header authentication and the `/v2/aggs` endpoint with
//! millisecond epoch timestamps.

use crate::common::{
    classify_status, normalize_rows, transport_error, wire_text, ApiCredentials, OhlcvSource,
};
use crate::rate_limit::{ProviderKey, RateLimitConfig, RateLimiter};
use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use types::{decimal_from_wire, BarBatch, BarRow, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

/// Subscription tier; decides the rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonTier {
    /// 5 requests/minute.
    Free,
    /// 100 requests/minute.
    Starter,
}

impl PolygonTier {
    fn label(&self) -> &'static str {
        match self {
            PolygonTier::Free => "free",
            PolygonTier::Starter => "starter",
        }
    }

    fn limits(&self) -> RateLimitConfig {
        match self {
            PolygonTier::Free => RateLimitConfig::per_minute(5),
            PolygonTier::Starter => RateLimitConfig::per_minute(100),
        }
    }
}

/// Timeframe mapping (canonical -> multiplier/timespan pair).
const AGG_SPANS: [(Timeframe, u32, &str); 6] = [
    (Timeframe::M1, 1, "minute"),
    (Timeframe::M5, 5, "minute"),
    (Timeframe::M15, 15, "minute"),
    (Timeframe::M30, 30, "minute"),
    (Timeframe::H1, 1, "hour"),
    (Timeframe::D1, 1, "day"),
];

pub struct PolygonAdapter {
    name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimiter,
    limiter_key: ProviderKey,
}

impl PolygonAdapter {
    /// Build an adapter with credentials from `POLYGON_API_KEY`.
    pub fn new(tier: PolygonTier, rate_limiter: RateLimiter) -> Result<Self> {
        let credentials = ApiCredentials::from_env("polygon", "POLYGON")?;
        Ok(Self::with_credentials(
            tier,
            rate_limiter,
            credentials.api_key,
            DEFAULT_BASE_URL.to_string(),
        ))
    }

    /// Test seam: explicit credentials and endpoint.
    pub fn with_credentials(
        tier: PolygonTier,
        rate_limiter: RateLimiter,
        api_key: String,
        base_url: String,
    ) -> Self {
        let limiter_key = ProviderKey::new("polygon", tier.label());
        rate_limiter.configure(limiter_key.clone(), tier.limits());
        Self {
            name: format!("polygon_{}", tier.label()),
            api_key,
            base_url,
            client: reqwest::Client::new(),
            rate_limiter,
            limiter_key,
        }
    }

    /// Crypto pairs go through the `X:` prefix; equities pass through
    /// uppercased.
    fn build_ticker(&self, symbol: &str) -> String {
        if symbol.contains('/') {
            format!("X:{}", symbol.to_uppercase().replace('/', ""))
        } else {
            symbol.to_uppercase()
        }
    }

    fn parse_error(&self, detail: &str) -> AdapterError {
        AdapterError::Parse {
            provider: self.name.clone(),
            detail: detail.to_string(),
        }
    }

    fn parse_aggregates(&self, data: &Value) -> Result<Vec<BarRow>> {
        let results = match data.get("results") {
            Some(Value::Array(results)) => results,
            // Zero aggregates come back without a results array.
            _ => return Ok(Vec::new()),
        };

        let mut rows = Vec::with_capacity(results.len());
        for item in results {
            let millis = item
                .get("t")
                .and_then(Value::as_i64)
                .ok_or_else(|| self.parse_error("aggregate missing 't' timestamp"))?;
            let ts = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| self.parse_error(&format!("timestamp {millis} out of range")))?;

            let field = |key: &str| -> Result<rust_decimal::Decimal> {
                let text = item
                    .get(key)
                    .and_then(|v| wire_text(v))
                    .ok_or_else(|| self.parse_error(&format!("aggregate missing '{key}'")))?;
                decimal_from_wire(&text)
                    .map_err(|e| self.parse_error(&format!("bad decimal in '{key}': {e}")))
            };

            rows.push(BarRow {
                ts,
                sid: 0,
                open: field("o")?,
                high: field("h")?,
                low: field("l")?,
                close: field("c")?,
                volume: field("v")?,
            });
        }
        Ok(rows)
    }
}

#[async_trait]
impl OhlcvSource for PolygonAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_config(&self) -> String {
        String::new()
    }

    fn source_url(&self) -> String {
        self.base_url.clone()
    }

    fn api_version(&self) -> Option<String> {
        Some("v2".to_string())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarBatch> {
        let (multiplier, timespan) = AGG_SPANS
            .iter()
            .find(|(tf, _, _)| *tf == timeframe)
            .map(|(_, m, s)| (*m, *s))
            .ok_or_else(|| {
                AdapterError::InvalidRequest(format!(
                    "provider {} does not support timeframe {timeframe}",
                    self.name
                ))
            })?;

        let ticker = self.build_ticker(symbol);
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            ticker,
            multiplier,
            timespan,
            start.timestamp_millis(),
            end.timestamp_millis(),
        );

        self.rate_limiter.acquire(&self.limiter_key).await?;

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("adjusted", "true"), ("sort", "asc"), ("limit", "50000")])
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AdapterError::SymbolNotFound {
                provider: self.name.clone(),
                symbol: symbol.to_string(),
            });
        }
        if let Some(err) = classify_status(&self.name, status) {
            return Err(err);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| self.parse_error(&format!("invalid JSON: {e}")))?;

        if let Some("ERROR") = data.get("status").and_then(Value::as_str) {
            let message = data
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error");
            return Err(self.parse_error(&format!("provider error: {message}")));
        }

        let rows = self.parse_aggregates(&data)?;
        debug!(
            provider = %self.name,
            symbol,
            ticker,
            rows = rows.len(),
            timeframe = %timeframe,
            "ohlcv_fetched"
        );
        normalize_rows(&self.name, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn adapter(base_url: String) -> PolygonAdapter {
        PolygonAdapter::with_credentials(
            PolygonTier::Starter,
            RateLimiter::new(),
            "test-key".to_string(),
            base_url,
        )
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2023, 1, 31, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn aggregates_parse_with_exact_decimals() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"{
            "status": "OK",
            "resultsCount": 2,
            "results": [
                {"t": 1672704000000, "o": 130.28, "h": 130.9, "l": 124.17, "c": 125.07, "v": 112117500},
                {"t": 1672790400000, "o": 126.89, "h": 128.66, "l": 125.08, "c": 126.36, "v": 89100000}
            ]
        }"#;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("AAPL", start, end, Timeframe::D1)
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        // JSON number literal preserved through the string round-trip.
        assert_eq!(batch.rows()[0].high, dec!(130.9));
        assert_eq!(batch.rows()[0].close, dec!(125.07));
    }

    #[tokio::test]
    async fn missing_results_is_an_empty_window() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status": "OK", "resultsCount": 0, "queryCount": 0}"#)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("AAPL", start, end, Timeframe::D1)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn not_found_maps_to_symbol_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(404)
            .with_body(r#"{"status": "NOT_FOUND"}"#)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("ZZZZ", start, end, Timeframe::D1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::SymbolNotFound { .. }));
    }

    #[tokio::test]
    async fn server_errors_are_retryable_network_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("AAPL", start, end, Timeframe::D1)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn crypto_pairs_get_the_x_prefix() {
        let adapter = adapter(DEFAULT_BASE_URL.to_string());
        assert_eq!(adapter.build_ticker("BTC/USD"), "X:BTCUSD");
        assert_eq!(adapter.build_ticker("aapl"), "AAPL");
    }
}
