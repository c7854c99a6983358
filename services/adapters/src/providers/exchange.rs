//! Unified crypto-exchange adapter over the klines REST shape.
//!
//! One adapter covers every exchange exposing a Binance-compatible
//! `/api/v3/klines` endpoint, keyed by exchange id. Klines carry prices as
//! wire strings, so decimals are constructed without any float edge.
//! Credentials are optional - klines are public market data - but are sent
//! when configured.

use crate::common::{classify_status, normalize_rows, transport_error, wire_text, OhlcvSource};
use crate::rate_limit::{ProviderKey, RateLimitConfig, RateLimiter};
use crate::{AdapterError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use types::{decimal_from_wire, BarBatch, BarRow, Timeframe};

/// Provider page size; the provider caps `limit` at 1000.
const KLINE_PAGE_LIMIT: usize = 1000;
/// Pagination backstop against a provider that never advances.
const MAX_PAGES: usize = 500;

/// Exchanges speaking the klines wire shape.
const EXCHANGES: [(&str, &str, u32); 3] = [
    ("binance", "https://api.binance.com", 1200),
    ("binanceus", "https://api.binance.us", 1200),
    ("mexc", "https://api.mexc.com", 500),
];

const INTERVALS: [(Timeframe, &str); 6] = [
    (Timeframe::M1, "1m"),
    (Timeframe::M5, "5m"),
    (Timeframe::M15, "15m"),
    (Timeframe::M30, "30m"),
    (Timeframe::H1, "1h"),
    (Timeframe::D1, "1d"),
];

#[derive(Debug)]
pub struct ExchangeAdapter {
    name: String,
    exchange_id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    rate_limiter: RateLimiter,
    limiter_key: ProviderKey,
}

impl ExchangeAdapter {
    /// Build an adapter for a known exchange id. Credentials are read from
    /// `<EXCHANGE>_API_KEY` when present; klines do not require them.
    pub fn new(exchange_id: &str, rate_limiter: RateLimiter) -> Result<Self> {
        let (id, base_url, rpm) = EXCHANGES
            .iter()
            .find(|(id, _, _)| *id == exchange_id)
            .copied()
            .ok_or_else(|| {
                AdapterError::InvalidRequest(format!(
                    "unknown exchange '{exchange_id}'; supported: {}",
                    EXCHANGES
                        .iter()
                        .map(|(id, _, _)| *id)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;
        let api_key = std::env::var(format!("{}_API_KEY", id.to_uppercase())).ok();
        Ok(Self::with_endpoint(
            id,
            base_url.to_string(),
            rpm,
            api_key,
            rate_limiter,
        ))
    }

    /// Test seam: explicit endpoint and limits.
    pub fn with_endpoint(
        exchange_id: &str,
        base_url: String,
        requests_per_minute: u32,
        api_key: Option<String>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let limiter_key = ProviderKey::new(exchange_id, "default");
        rate_limiter.configure(
            limiter_key.clone(),
            RateLimitConfig::per_minute(requests_per_minute),
        );
        Self {
            name: format!("exchange_{exchange_id}"),
            exchange_id: exchange_id.to_string(),
            base_url,
            api_key,
            client: reqwest::Client::new(),
            rate_limiter,
            limiter_key,
        }
    }

    /// `BTC/USDT` and `BTC-USDT` both map to the exchange's `BTCUSDT`.
    fn wire_symbol(symbol: &str) -> String {
        symbol.to_uppercase().replace(['/', '-'], "")
    }

    fn parse_error(&self, detail: &str) -> AdapterError {
        AdapterError::Parse {
            provider: self.name.clone(),
            detail: detail.to_string(),
        }
    }

    fn parse_kline(&self, entry: &Value) -> Result<BarRow> {
        let Some(fields) = entry.as_array() else {
            return Err(self.parse_error("kline entry is not an array"));
        };
        if fields.len() < 6 {
            return Err(self.parse_error(&format!(
                "kline entry has {} fields, expected at least 6",
                fields.len()
            )));
        }

        let millis = fields[0]
            .as_i64()
            .ok_or_else(|| self.parse_error("kline open time is not an integer"))?;
        let ts = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| self.parse_error(&format!("timestamp {millis} out of range")))?;

        let price = |index: usize, label: &str| -> Result<rust_decimal::Decimal> {
            let text = wire_text(&fields[index])
                .ok_or_else(|| self.parse_error(&format!("kline {label} is not a value")))?;
            decimal_from_wire(&text)
                .map_err(|e| self.parse_error(&format!("bad decimal in {label}: {e}")))
        };

        Ok(BarRow {
            ts,
            sid: 0,
            open: price(1, "open")?,
            high: price(2, "high")?,
            low: price(3, "low")?,
            close: price(4, "close")?,
            volume: price(5, "volume")?,
        })
    }

    async fn fetch_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Value>> {
        self.rate_limiter.acquire(&self.limiter_key).await?;

        let url = format!("{}/api/v3/klines", self.base_url);
        let mut request = self.client.get(&url).query(&[
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", KLINE_PAGE_LIMIT.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let status = response.status();

        // 418 is the exchange's "banned for repeated 429s" signal.
        if status.as_u16() == 418 {
            return Err(AdapterError::RateLimited {
                provider: self.name.clone(),
                retry_after: None,
            });
        }
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body: Value = response
                .json()
                .await
                .map_err(|e| self.parse_error(&format!("invalid JSON: {e}")))?;
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = body.get("msg").and_then(Value::as_str).unwrap_or("");
            if code == -1121 || message.contains("Invalid symbol") {
                return Err(AdapterError::SymbolNotFound {
                    provider: self.name.clone(),
                    symbol: symbol.to_string(),
                });
            }
            return Err(self.parse_error(&format!("provider rejected request: {message}")));
        }
        if let Some(err) = classify_status(&self.name, status) {
            return Err(err);
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| self.parse_error(&format!("invalid JSON: {e}")))?;
        match data {
            Value::Array(entries) => Ok(entries),
            _ => Err(self.parse_error("kline response is not an array")),
        }
    }
}

#[async_trait]
impl OhlcvSource for ExchangeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_config(&self) -> String {
        format!("exchange_id={}", self.exchange_id)
    }

    fn source_url(&self) -> String {
        self.base_url.clone()
    }

    fn api_version(&self) -> Option<String> {
        Some("v3".to_string())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timeframe: Timeframe,
    ) -> Result<BarBatch> {
        let interval = crate::common::map_timeframe(&self.name, timeframe, &INTERVALS)?;
        let wire_symbol = Self::wire_symbol(symbol);
        let end_ms = end.timestamp_millis();
        let step_ms = timeframe.duration().num_milliseconds();

        let mut rows: Vec<BarRow> = Vec::new();
        let mut cursor = start.timestamp_millis();
        let mut pages = 0usize;

        while cursor <= end_ms {
            let entries = self
                .fetch_page(&wire_symbol, interval, cursor, end_ms)
                .await?;
            if entries.is_empty() {
                break;
            }
            let page_len = entries.len();
            let mut last_open_ms = cursor;
            for entry in &entries {
                let row = self.parse_kline(entry)?;
                last_open_ms = row.ts.timestamp_millis();
                rows.push(row);
            }

            if page_len < KLINE_PAGE_LIMIT {
                break;
            }
            cursor = last_open_ms + step_ms;
            pages += 1;
            if pages >= MAX_PAGES {
                warn!(
                    provider = %self.name,
                    symbol,
                    pages,
                    "pagination backstop hit; window truncated"
                );
                break;
            }
        }

        debug!(
            provider = %self.name,
            symbol,
            wire_symbol,
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

    fn adapter(base_url: String) -> ExchangeAdapter {
        ExchangeAdapter::with_endpoint("binance", base_url, 1200, None, RateLimiter::new())
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn klines_parse_wire_strings_exactly() {
        let mut server = mockito::Server::new_async().await;
        let body = r#"[
            [1704067200000, "42283.58000000", "42554.57000000", "42261.02000000", "42475.23000000", "1271.68313000", 1704070799999, "0", 0, "0", "0", "0"],
            [1704070800000, "42475.23000000", "42638.00000000", "42430.44000000", "42613.14000000", "987.12345678", 1704074399999, "0", 0, "0", "0", "0"]
        ]"#;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("BTC/USDT", start, end, Timeframe::H1)
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows()[0].open, dec!(42283.58000000));
        assert_eq!(batch.rows()[1].volume, dec!(987.12345678));
        assert_eq!(
            batch.rows()[0].ts,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_symbol_maps_to_symbol_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(400)
            .with_body(r#"{"code": -1121, "msg": "Invalid symbol."}"#)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("NOPE/USDT", start, end, Timeframe::H1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::SymbolNotFound { .. }));
    }

    #[tokio::test]
    async fn empty_window_is_an_empty_batch() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let batch = adapter
            .fetch_ohlcv("BTC/USDT", start, end, Timeframe::H1)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn teapot_status_is_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(418)
            .create_async()
            .await;

        let adapter = adapter(server.url());
        let (start, end) = range();
        let err = adapter
            .fetch_ohlcv("BTC/USDT", start, end, Timeframe::H1)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::RateLimited { .. }));
    }

    #[test]
    fn unknown_exchange_is_invalid_request() {
        let err = ExchangeAdapter::new("hyperspace", RateLimiter::new()).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidRequest(_)));
    }

    #[test]
    fn symbols_normalize_to_wire_format() {
        assert_eq!(ExchangeAdapter::wire_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(ExchangeAdapter::wire_symbol("eth-usd"), "ETHUSD");
    }
}
