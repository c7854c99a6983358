//! Rate limiting for provider API requests.
//!
//! One governor token bucket per `(provider, tier)` key, refilled
//! continuously at `requests_per_minute / 60` tokens per second, plus an
//! optional daily request cap. Acquiring suspends cooperatively until a
//! token is available; an exhausted daily cap fails fast with
//! `QuotaExceeded` and must not be retried until the next day window.

use crate::{AdapterError, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

/// How the daily request cap measures "a day".
///
/// Providers are not explicit about this, so it is configurable; the
/// calendar-UTC window matches how published quotas reset in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaWindow {
    /// Resets at midnight UTC.
    #[default]
    CalendarUtc,
    /// Trailing 24 hours.
    Rolling24h,
}

/// Per-provider rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_day: Option<u32>,
    pub quota_window: QuotaWindow,
}

impl RateLimitConfig {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            requests_per_day: None,
            quota_window: QuotaWindow::default(),
        }
    }

    pub fn with_daily_cap(mut self, requests_per_day: u32) -> Self {
        self.requests_per_day = Some(requests_per_day);
        self
    }
}

/// Key identifying one bucket: provider name plus subscription tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub provider: String,
    pub tier: String,
}

impl ProviderKey {
    pub fn new(provider: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            tier: tier.into(),
        }
    }
}

#[derive(Debug)]
enum DailyUsage {
    Calendar(Mutex<(NaiveDate, u32)>),
    Rolling(Mutex<VecDeque<DateTime<Utc>>>),
}

#[derive(Debug)]
struct DailyQuota {
    limit: u32,
    usage: DailyUsage,
}

impl DailyQuota {
    fn new(limit: u32, window: QuotaWindow) -> Self {
        let usage = match window {
            QuotaWindow::CalendarUtc => {
                DailyUsage::Calendar(Mutex::new((Utc::now().date_naive(), 0)))
            }
            QuotaWindow::Rolling24h => DailyUsage::Rolling(Mutex::new(VecDeque::new())),
        };
        Self { limit, usage }
    }

    /// Consume one request from the daily budget, or fail with the count
    /// untouched.
    fn try_consume(&self, provider: &str) -> Result<()> {
        match &self.usage {
            DailyUsage::Calendar(state) => {
                let mut state = state.lock();
                let today = Utc::now().date_naive();
                if state.0 != today {
                    *state = (today, 0);
                }
                if state.1 >= self.limit {
                    return Err(AdapterError::QuotaExceeded {
                        provider: provider.to_string(),
                        limit: self.limit,
                    });
                }
                state.1 += 1;
                Ok(())
            }
            DailyUsage::Rolling(times) => {
                let mut times = times.lock();
                let cutoff = Utc::now() - ChronoDuration::hours(24);
                while times.front().is_some_and(|t| *t < cutoff) {
                    times.pop_front();
                }
                if times.len() as u32 >= self.limit {
                    return Err(AdapterError::QuotaExceeded {
                        provider: provider.to_string(),
                        limit: self.limit,
                    });
                }
                times.push_back(Utc::now());
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
struct ProviderBucket {
    bucket: DefaultDirectRateLimiter,
    daily: Option<DailyQuota>,
}

/// Rate limiter shared by every adapter in the process.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    limiters: Arc<DashMap<ProviderKey, Arc<ProviderBucket>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with no configured providers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure (or replace) the limits for a provider key.
    pub fn configure(&self, key: ProviderKey, config: RateLimitConfig) {
        let Ok(rate) = NonZeroU32::try_from(config.requests_per_minute) else {
            warn!(
                provider = %key.provider,
                tier = %key.tier,
                requests_per_minute = config.requests_per_minute,
                "invalid rate limit ignored"
            );
            return;
        };
        let bucket = DefaultDirectRateLimiter::direct(Quota::per_minute(rate));
        let daily = config
            .requests_per_day
            .map(|limit| DailyQuota::new(limit, config.quota_window));
        debug!(
            provider = %key.provider,
            tier = %key.tier,
            requests_per_minute = config.requests_per_minute,
            requests_per_day = ?config.requests_per_day,
            "rate_limit_configured"
        );
        self.limiters
            .insert(key, Arc::new(ProviderBucket { bucket, daily }));
    }

    /// Suspend until one request is allowed. A provider with no configured
    /// limit passes immediately; an exhausted daily cap fails with
    /// `QuotaExceeded` without waiting on the bucket.
    pub async fn acquire(&self, key: &ProviderKey) -> Result<()> {
        // Clone out of the shard so the map lock is not held across awaits.
        let entry = self.limiters.get(key).map(|e| e.value().clone());
        let Some(entry) = entry else {
            return Ok(());
        };
        if let Some(daily) = &entry.daily {
            daily.try_consume(&key.provider)?;
        }
        entry.bucket.until_ready().await;
        Ok(())
    }

    /// Non-blocking probe: would a request be allowed right now?
    pub fn check(&self, key: &ProviderKey) -> bool {
        self.limiters
            .get(key)
            .map(|entry| entry.bucket.check().is_ok())
            .unwrap_or(true)
    }
}
