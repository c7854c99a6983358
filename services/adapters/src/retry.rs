//! Retry executor with exponential backoff and jitter.
//!
//! Wraps any idempotent fetch. The retry decision is a pure function of the
//! error kind: only `Network` and `RateLimited` are retried; `RateLimited`
//! waits the provider's hint when one was sent, otherwise the backoff
//! schedule applies. The whole attempt sequence is bounded by a total
//! deadline, which is also the cancellation point for the orchestrator.

use crate::{AdapterError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff and deadline configuration for one class of fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First backoff delay; doubles every attempt.
    pub base_delay: Duration,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Wall-clock budget for the whole sequence.
    pub total_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: 5,
            total_deadline: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `n + 1`: `base * 2^n`, jittered +/-25%.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        exp.mul_f64(jitter)
    }

    /// Run `op` until it succeeds, fails terminally, or exhausts the
    /// attempt/deadline budget. `op` must be idempotent.
    pub async fn execute<T, F, Fut>(&self, provider: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = async {
            let mut attempt: u32 = 0;
            loop {
                match op().await {
                    Ok(value) => {
                        if attempt > 0 {
                            debug!(provider, attempt, "fetch_recovered_after_retry");
                        }
                        return Ok(value);
                    }
                    Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                        let delay = match &err {
                            AdapterError::RateLimited {
                                retry_after: Some(hint),
                                ..
                            } => *hint,
                            _ => self.backoff_delay(attempt),
                        };
                        warn!(
                            provider,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "fetch_retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        match tokio::time::timeout(self.total_deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Network {
                provider: provider.to_string(),
                reason: format!(
                    "total deadline of {:?} exceeded",
                    self.total_deadline
                ),
            }),
        }
    }
}
