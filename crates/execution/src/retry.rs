//! Retry policy for transient handler failures.

use crate::config::{BackoffStrategy, RetryConfig};
use std::time::Duration;

/// Decides whether and when to retry a transient failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    strategy: BackoffStrategy,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self::new(0, BackoffStrategy::Fixed, 0, 0)
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether retry number `retry` (0-indexed) is within budget.
    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Delay before retry number `retry` (0-indexed), capped at the maximum.
    pub fn delay(&self, retry: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(retry)),
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.strategy,
            config.base_delay_ms,
            config.max_delay_ms,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
