//! Shared backoff/retry policy.
//!
//! One policy serves both the request pipeline and connection-level
//! reconnection: exponential delay growth with a strategy-selected base and
//! cap, bounded random jitter against synchronized retry storms, and a
//! single retryability classification over the crate error taxonomy.

use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// HTTP statuses worth retrying: the 5xx family plus the CDN/edge error
/// codes the backend's fronting layer is known to emit.
const RETRYABLE_STATUSES: &[u16] = &[500, 502, 503, 504, 507, 508, 520, 521, 522, 524];

/// Named retry strategy selecting base delay, growth, and cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Short base delay, fast growth, low cap. For latency-sensitive calls
    /// where a stale answer is worse than no answer.
    Aggressive,
    /// The default trade-off for REST calls.
    Balanced,
    /// Long base delay and high cap. For connection-level reconnection,
    /// where hammering a struggling backend helps nobody.
    Conservative,
}

impl RetryStrategy {
    fn base_delay_ms(self) -> u64 {
        match self {
            Self::Aggressive => 200,
            Self::Balanced => 500,
            Self::Conservative => 1_000,
        }
    }

    fn multiplier(self) -> f64 {
        match self {
            Self::Aggressive => 1.5,
            Self::Balanced => 2.0,
            Self::Conservative => 2.0,
        }
    }

    fn max_delay_ms(self) -> u64 {
        match self {
            Self::Aggressive => 3_000,
            Self::Balanced => 10_000,
            Self::Conservative => 30_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial try.
    pub max_retries: u32,
    /// Delay strategy.
    pub strategy: RetryStrategy,
    /// Jitter factor (0.0 - 1.0): random fraction of the computed delay
    /// added on top.
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Default policy for HTTP requests: 3 retries, balanced delays.
    pub fn for_requests() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Balanced,
            jitter_factor: 0.2,
        }
    }

    /// Policy for connection-level reconnection: 10 attempts, conservative
    /// delays. Losing a live connection is more consequential than a
    /// single API call, so the budget is larger.
    pub fn for_connection() -> Self {
        Self {
            max_retries: 10,
            strategy: RetryStrategy::Conservative,
            jitter_factor: 0.25,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_requests()
    }
}

/// Computes retry delays and retryability from an error and attempt count.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Creates a policy from the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy with the HTTP request defaults.
    pub fn for_requests() -> Self {
        Self::new(RetryConfig::for_requests())
    }

    /// Policy with the connection-level reconnection defaults.
    pub fn for_connection() -> Self {
        Self::new(RetryConfig::for_connection())
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns the maximum number of retries.
    #[inline]
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether the given error on the given attempt (0-based count of
    /// retries already performed) should be retried.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.config.max_retries && Self::is_retryable(error)
    }

    /// Classifies an error as retryable.
    ///
    /// Retryable: transient network failures (no response reachable),
    /// rate limits, timeouts, and API responses whose status is in the
    /// fixed retryable set (5xx family + known edge codes). Everything
    /// else (client errors, authentication, cancellation) is not.
    #[must_use]
    pub fn is_retryable(error: &Error) -> bool {
        match error.root_cause() {
            Error::Network(ne) => ne.is_transient(),
            Error::RateLimit { .. } | Error::Timeout(_) => true,
            Error::Api { status, .. } => Self::is_retryable_status(*status),
            _ => false,
        }
    }

    /// Whether an HTTP status is in the retryable set.
    #[must_use]
    pub fn is_retryable_status(status: u16) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Computes the delay before the next attempt.
    ///
    /// `attempt` is the 0-based count of retries already performed: the
    /// first retry waits the base delay, each further retry multiplies it,
    /// capped at the strategy maximum, plus bounded random jitter. A
    /// rate-limit `retry_after` hint overrides the computed floor.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, error: Option<&Error>) -> Duration {
        let strategy = self.config.strategy;
        let base_ms = strategy.base_delay_ms() as f64;
        let exponential_ms = base_ms * strategy.multiplier().powi(attempt as i32);
        let mut delay_ms = exponential_ms.min(strategy.max_delay_ms() as f64);

        if let Some(hint) = error.and_then(Error::retry_after) {
            delay_ms = delay_ms.max(hint.as_millis() as f64);
        }

        let jitter_ms = if self.config.jitter_factor > 0.0 {
            let jitter_range = delay_ms * self.config.jitter_factor;
            rand::rng().random::<f64>() * jitter_range
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter_ms) as u64)
    }

    /// The delay without the jitter component. Used by tests asserting
    /// monotone growth.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    #[must_use]
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let strategy = self.config.strategy;
        let base_ms = strategy.base_delay_ms() as f64;
        let exponential_ms = base_ms * strategy.multiplier().powi(attempt as i32);
        Duration::from_millis(exponential_ms.min(strategy.max_delay_ms() as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_requests()
    }
}
