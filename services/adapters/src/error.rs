//! Error types for the adapter service.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Main error type for adapter operations.
///
/// The retry executor is a pure function of this taxonomy: only
/// [`AdapterError::is_retryable`] errors are ever retried, everything else
/// propagates to the orchestrator on the first occurrence.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transport failure (connect, timeout, 5xx)
    #[error("network error for provider {provider}: {reason}")]
    Network {
        /// The provider that failed
        provider: String,
        /// Reason for the failure
        reason: String,
    },

    /// Provider throttled the request
    #[error("rate limited by provider {provider}")]
    RateLimited {
        /// The provider that throttled us
        provider: String,
        /// Wait hint from the provider, when it sent one
        retry_after: Option<Duration>,
    },

    /// Bad or missing credential; fatal to the adapter instance
    #[error("authentication failed for provider {provider}: {detail}")]
    Auth {
        /// The provider that rejected the credential
        provider: String,
        /// What was wrong
        detail: String,
    },

    /// Provider does not know the symbol; per-symbol, does not fail the job
    #[error("symbol '{symbol}' not found on provider {provider}")]
    SymbolNotFound {
        /// The provider queried
        provider: String,
        /// The unknown symbol
        symbol: String,
    },

    /// Malformed provider response
    #[error("parse error from provider {provider}: {detail}")]
    Parse {
        /// The provider whose response failed to parse
        provider: String,
        /// Description of the failure
        detail: String,
    },

    /// OHLCV invariant broken after normalization; blocks the write
    #[error(transparent)]
    Validation(#[from] types::ValidationError),

    /// Daily request cap exhausted; the job is deferred, not retried
    #[error("daily quota of {limit} requests exhausted for provider {provider}")]
    QuotaExceeded {
        /// The capped provider
        provider: String,
        /// The configured daily limit
        limit: u32,
    },

    /// Request the adapter cannot express (unknown timeframe, bad symbol
    /// format)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Filesystem failure (CSV adapter)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether the retry executor may attempt this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::Network { .. } | AdapterError::RateLimited { .. }
        )
    }

    /// Whether this failure condemns the adapter instance rather than the
    /// single request.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AdapterError::Auth { .. }
                | AdapterError::QuotaExceeded { .. }
                | AdapterError::InvalidRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        let network = AdapterError::Network {
            provider: "p".into(),
            reason: "reset".into(),
        };
        let limited = AdapterError::RateLimited {
            provider: "p".into(),
            retry_after: None,
        };
        let auth = AdapterError::Auth {
            provider: "p".into(),
            detail: "bad key".into(),
        };
        let quota = AdapterError::QuotaExceeded {
            provider: "p".into(),
            limit: 500,
        };

        assert!(network.is_retryable());
        assert!(limited.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!quota.is_retryable());
        assert!(auth.is_permanent());
        assert!(quota.is_permanent());
        assert!(!network.is_permanent());
    }
}
