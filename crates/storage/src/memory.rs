//! In-memory state store.

use crate::{Result, StateStore};
use async_trait::async_trait;
use converge_core::{AppliedItemRecord, RecordKey, TargetId};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Volatile state store for tests and embedding.
///
/// Each operation holds the map lock only for its own duration.
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<RecordKey, AppliedItemRecord>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_record(&self, key: &RecordKey) -> Result<Option<AppliedItemRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn put_record(&self, record: &AppliedItemRecord) -> Result<()> {
        self.records.write().await.insert(record.key(), record.clone());
        Ok(())
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn list_records(&self, target: &TargetId) -> Result<Vec<AppliedItemRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|(key, _)| &key.target == target)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn list_targets(&self) -> Result<Vec<TargetId>> {
        let mut targets: Vec<TargetId> = self
            .records
            .read()
            .await
            .keys()
            .map(|key| key.target.clone())
            .collect();
        targets.dedup();
        Ok(targets)
    }
}
