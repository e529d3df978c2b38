//! Share handler (`share` category).
//!
//! Resource keys are share names. The share table is one JSON document
//! mapping names to `{"path", "comment"?, "max_users"?}`.

use crate::convergence::{plan_change, Plan};
use crate::document::JsonDocument;
use crate::r#trait::{ApplyResult, ExecutionMode, HandlerError, ResourceHandler, ResourceState};
use async_trait::async_trait;
use converge_core::{Action, Category, PreferenceItem};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// A share definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShareSpec {
    /// Shared directory
    pub path: String,

    /// Description shown to clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Connection limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_users: Option<u64>,
}

/// Fields an `Update` may carry.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SharePatch {
    path: Option<String>,
    comment: Option<String>,
    max_users: Option<u64>,
}

impl SharePatch {
    /// The patch as a merge payload holding only the fields it sets.
    fn into_payload(self) -> Value {
        let mut fields = Map::new();
        if let Some(path) = self.path {
            fields.insert("path".into(), Value::String(path));
        }
        if let Some(comment) = self.comment {
            fields.insert("comment".into(), Value::String(comment));
        }
        if let Some(max_users) = self.max_users {
            fields.insert("max_users".into(), Value::from(max_users));
        }
        Value::Object(fields)
    }
}

/// Handler for shared folders.
pub struct ShareHandler {
    doc: JsonDocument,
}

impl ShareHandler {
    /// Volatile share table.
    pub fn in_memory() -> Self {
        Self {
            doc: JsonDocument::in_memory(),
        }
    }

    /// Share table persisted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HandlerError> {
        Ok(Self {
            doc: JsonDocument::open(path).await?,
        })
    }

    /// Current definition of a share.
    pub async fn get(&self, name: &str) -> Option<ShareSpec> {
        self.doc
            .get(name)
            .await
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

fn malformed(name: &str, err: serde_json::Error) -> HandlerError {
    HandlerError::MalformedPayload(format!("share {}: {}", name, err))
}

#[async_trait]
impl ResourceHandler for ShareHandler {
    fn category(&self) -> Category {
        Category::Share
    }

    fn name(&self) -> &str {
        "share"
    }

    fn supports_update(&self) -> bool {
        true
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Async
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
        let name = item.resource_key.as_str();
        let desired;
        let item = match item.action {
            Action::Create | Action::Replace => {
                let definition: ShareSpec =
                    serde_json::from_value(item.payload.clone()).map_err(|e| malformed(name, e))?;
                desired = PreferenceItem {
                    payload: serde_json::to_value(&definition).map_err(|e| malformed(name, e))?,
                    ..item.clone()
                };
                &desired
            }
            Action::Update => {
                let patch: SharePatch =
                    serde_json::from_value(item.payload.clone()).map_err(|e| malformed(name, e))?;
                desired = PreferenceItem {
                    payload: patch.into_payload(),
                    ..item.clone()
                };
                &desired
            }
            Action::Delete => item,
        };

        let mut table = self.doc.lock().await;
        let current = table
            .get(name)
            .map(|value| ResourceState::new(name, value.clone()));
        let plan = plan_change(item, current.as_ref(), self.supports_update())?;
        let change = plan.change();

        let mut next = table.clone();
        match plan {
            Plan::Noop => return Ok(ApplyResult::new(change)),
            Plan::Write { value, .. } => {
                // An update may not leave a share without a path.
                serde_json::from_value::<ShareSpec>(value.clone()).map_err(|e| malformed(name, e))?;
                next.insert(name.to_string(), value);
            }
            Plan::Remove => {
                next.remove(name);
            }
        }
        self.doc.commit(&mut table, next).await?;
        tracing::debug!(share = %name, %change, "share converged");
        Ok(ApplyResult::new(change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::Change;
    use serde_json::json;

    fn share(action: Action, payload: serde_json::Value) -> PreferenceItem {
        PreferenceItem::new(Category::Share, "docs", action, payload)
    }

    #[tokio::test]
    async fn test_create_and_update_share() {
        let handler = ShareHandler::in_memory();
        let r = handler
            .apply(&share(Action::Create, json!({"path": "/srv/docs"})), None)
            .await
            .unwrap();
        assert_eq!(r.change, Change::Created);

        let r = handler
            .apply(&share(Action::Update, json!({"comment": "Team docs", "max_users": 10})), None)
            .await
            .unwrap();
        assert_eq!(r.change, Change::Updated);
        assert_eq!(
            handler.get("docs").await.unwrap(),
            ShareSpec {
                path: "/srv/docs".into(),
                comment: Some("Team docs".into()),
                max_users: Some(10),
            }
        );

        let again = handler
            .apply(&share(Action::Update, json!({"comment": "Team docs"})), None)
            .await
            .unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_create_requires_path() {
        let handler = ShareHandler::in_memory();
        assert!(matches!(
            handler.apply(&share(Action::Create, json!({"comment": "x"})), None).await,
            Err(HandlerError::MalformedPayload(_))
        ));
        assert!(matches!(
            handler.apply(&share(Action::Update, json!({"comment": "x"})), None).await,
            Err(HandlerError::MalformedPayload(_))
        ));
        assert!(matches!(
            handler.apply(&share(Action::Update, json!({"colour": "red"})), None).await,
            Err(HandlerError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_share() {
        let handler = ShareHandler::in_memory();
        handler
            .apply(&share(Action::Replace, json!({"path": "/srv/docs"})), None)
            .await
            .unwrap();
        let r = handler.apply(&share(Action::Delete, json!(null)), None).await.unwrap();
        assert_eq!(r.change, Change::Deleted);
        assert!(handler.get("docs").await.is_none());
        assert!(handler
            .apply(&share(Action::Delete, json!(null)), None)
            .await
            .unwrap()
            .is_noop());
    }

    #[tokio::test]
    async fn test_update_ignores_null_fields() {
        let handler = ShareHandler::in_memory();
        handler
            .apply(&share(Action::Create, json!({"path": "/srv/docs", "comment": "Docs"})), None)
            .await
            .unwrap();
        let r = handler
            .apply(&share(Action::Update, json!({"comment": null, "max_users": 3})), None)
            .await
            .unwrap();
        assert_eq!(r.change, Change::Updated);
        let docs = handler.get("docs").await.unwrap();
        assert_eq!(docs.comment.as_deref(), Some("Docs"));
        assert_eq!(docs.max_users, Some(3));
    }

    #[tokio::test]
    async fn test_failed_save_is_not_reported_as_applied_on_retry() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("shares");
        let handler = ShareHandler::open(blocker.join("shares.json")).await.unwrap();
        std::fs::write(&blocker, "").unwrap();

        let create = share(Action::Create, json!({"path": "/srv/docs"}));
        assert!(handler.apply(&create, None).await.is_err());
        assert!(handler.apply(&create, None).await.is_err());
        assert!(handler.get("docs").await.is_none());

        std::fs::remove_file(&blocker).unwrap();
        let r = handler.apply(&create, None).await.unwrap();
        assert_eq!(r.change, Change::Created);
        let reopened = ShareHandler::open(blocker.join("shares.json")).await.unwrap();
        assert_eq!(reopened.get("docs").await.unwrap().path, "/srv/docs");
    }

    #[tokio::test]
    async fn test_share_table_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.json");
        ShareHandler::open(&path)
            .await
            .unwrap()
            .apply(&share(Action::Create, json!({"path": "/srv/docs", "max_users": 5})), None)
            .await
            .unwrap();

        let reopened = ShareHandler::open(&path).await.unwrap();
        assert_eq!(reopened.get("docs").await.unwrap().max_users, Some(5));
    }
}
