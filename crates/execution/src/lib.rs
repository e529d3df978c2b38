//! Execution layer - processing cycles, retries, cancellation and diagnostics.

#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod retry;
mod scheduler;

pub use cancel::{CancelHandle, CancelToken};
pub use config::{BackoffStrategy, ConfigError, EngineConfig, RetryConfig};
pub use diagnostics::{DiagnosticsSink, FanoutSink, JsonLinesSink, MemorySink, TracingSink};
pub use engine::{ConvergenceEngine, CycleError, RunOptions, TargetLocks, UNREGISTERED};
pub use retry::RetryPolicy;
