//! State store trait abstraction.

use async_trait::async_trait;
use converge_core::{AppliedItemRecord, RecordKey, TargetId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Persistent applied-item records, keyed by [`RecordKey`].
///
/// Implementations hold no lock beyond a single call, so cycles for
/// different targets never wait on each other for longer than one operation.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a record.
    async fn get_record(&self, key: &RecordKey) -> Result<Option<AppliedItemRecord>>;

    /// Save a record (create or overwrite).
    async fn put_record(&self, record: &AppliedItemRecord) -> Result<()>;

    /// Delete a record. Deleting an absent record succeeds.
    async fn delete_record(&self, key: &RecordKey) -> Result<()>;

    /// All records of a target, ordered by category then resource key.
    async fn list_records(&self, target: &TargetId) -> Result<Vec<AppliedItemRecord>>;

    /// Targets that have at least one record.
    async fn list_targets(&self) -> Result<Vec<TargetId>>;
}
