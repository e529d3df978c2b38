//! Key/value settings handler (`registry` category).
//!
//! Each resource key names a hive key; its value is a JSON object of named
//! values. The whole hive is one JSON document.

use crate::convergence::{plan_change, Plan};
use crate::document::JsonDocument;
use crate::r#trait::{ApplyResult, ExecutionMode, HandlerError, ResourceHandler, ResourceState};
use async_trait::async_trait;
use converge_core::{Action, Category, PreferenceItem};
use std::path::Path;

/// Handler for hierarchical key/value settings.
pub struct KeyValueHandler {
    doc: JsonDocument,
}

impl KeyValueHandler {
    /// Volatile hive.
    pub fn in_memory() -> Self {
        Self {
            doc: JsonDocument::in_memory(),
        }
    }

    /// Hive persisted at `path`, created on first write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HandlerError> {
        Ok(Self {
            doc: JsonDocument::open(path).await?,
        })
    }
}

#[async_trait]
impl ResourceHandler for KeyValueHandler {
    fn category(&self) -> Category {
        Category::Registry
    }

    fn name(&self) -> &str {
        "registry"
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    async fn read(&self, key: &str) -> Result<ResourceState, HandlerError> {
        self.doc
            .get(key)
            .await
            .map(|value| ResourceState::new(key, value))
            .ok_or_else(|| HandlerError::NotFound(key.to_string()))
    }

    async fn apply(
        &self,
        item: &PreferenceItem,
        _current: Option<&ResourceState>,
    ) -> Result<ApplyResult, HandlerError> {
        if matches!(item.action, Action::Create | Action::Replace) && !item.payload.is_object() {
            return Err(HandlerError::MalformedPayload(format!(
                "registry key {} needs an object of named values",
                item.resource_key
            )));
        }

        // The hive is re-read under its lock so concurrent cycles see each
        // other's writes.
        let mut table = self.doc.lock().await;
        let current = table
            .get(&item.resource_key)
            .map(|value| ResourceState::new(&item.resource_key, value.clone()));
        let plan = plan_change(item, current.as_ref(), self.supports_update())?;
        let change = plan.change();

        let mut next = table.clone();
        match plan {
            Plan::Noop => return Ok(ApplyResult::new(change)),
            Plan::Write { value, .. } => {
                next.insert(item.resource_key.clone(), value);
            }
            Plan::Remove => {
                next.remove(&item.resource_key);
            }
        }
        self.doc.commit(&mut table, next).await?;
        tracing::debug!(key = %item.resource_key, %change, "registry key converged");
        Ok(ApplyResult::new(change))
    }
}
