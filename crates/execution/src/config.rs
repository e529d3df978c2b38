//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid configuration JSON
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How retry delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `base * n`
    Linear,
    /// `base * 2^n`
    #[default]
    Exponential,
}

/// Retry settings for transient handler failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay growth
    pub strategy: BackoffStrategy,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

/// Configuration for the convergence engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy
    pub retry: RetryConfig,
    /// Timeout for one async handler invocation
    pub item_timeout_ms: u64,
    /// Items in flight for handlers that allow concurrent writes
    pub max_parallel_items: usize,
    /// Records kept by the in-memory diagnostics sink
    pub diagnostics_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            item_timeout_ms: 30_000,
            max_parallel_items: 4,
            diagnostics_retention: 10_000,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let json = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.item_timeout_ms == 0 {
            return Err(ConfigError::Invalid("item_timeout_ms must be positive".into()));
        }
        if self.max_parallel_items == 0 {
            return Err(ConfigError::Invalid("max_parallel_items must be at least 1".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-item timeout.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set the parallelism for concurrent-safe handlers.
    pub fn with_max_parallel_items(mut self, max: usize) -> Self {
        self.max_parallel_items = max;
        self
    }

    /// Per-item timeout.
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}
