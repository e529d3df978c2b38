//! Resource handler abstraction.

use async_trait::async_trait;
use converge_core::{Category, Change, PreferenceItem};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the engine invokes a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Awaited inline by the cycle
    #[default]
    Sync,
    /// Run on its own task under the per-item timeout
    Async,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "sync"),
            ExecutionMode::Async => write!(f, "async"),
        }
    }
}

/// Current state of a resource as read by its handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource key
    pub key: String,

    /// Current value, in the category's payload shape
    pub value: serde_json::Value,
}

impl ResourceState {
    /// Create a state.
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// What a successful apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Change made
    pub change: Change,
}

impl ApplyResult {
    /// Result with the given change.
    pub fn new(change: Change) -> Self {
        Self { change }
    }

    /// Whether the resource was left untouched.
    pub fn is_noop(&self) -> bool {
        self.change == Change::Unchanged
    }
}

/// Errors reported by handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Temporary failure; worth retrying
    #[error("transient failure: {0}")]
    Transient(String),

    /// Failure that will not go away by retrying
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// `Update` on a category without partial-update semantics
    #[error("category {category} does not support update")]
    UnsupportedMerge {
        /// Category of the item
        category: Category,
    },

    /// Payload has the wrong shape for the category
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Handler did not finish within the item timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    /// Whether the engine should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Timeout(_))
    }

    /// Classify an I/O error: interruptions and timeouts are transient.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                HandlerError::Transient(message)
            }
            _ => HandlerError::Permanent(message),
        }
    }
}

/// A pluggable handler for one resource category.
///
/// `apply` must be idempotent: applying the same item to the state it
/// produced changes nothing.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Category owned by this handler.
    fn category(&self) -> Category;

    /// Handler name, for reports and logs.
    fn name(&self) -> &str;

    /// Whether `Update` (partial merge) is supported.
    fn supports_update(&self) -> bool;

    /// How the engine should invoke the handler.
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    /// Whether items with distinct keys may be applied in parallel.
    fn concurrent_writes(&self) -> bool {
        false
    }

    /// Read the current state of `key`; `NotFound` if absent.
    async fn read(&self, key: &str) -> Result<ResourceState, HandlerError>;

    /// Converge the resource towards `item`.
    async fn apply(
        &self,
        item: &PreferenceItem,
        current: Option<&ResourceState>,
    ) -> Result<ApplyResult, HandlerError>;
}
