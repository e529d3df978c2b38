//! File handler (`file` category).
//!
//! Resource keys are paths relative to the handler's root; payload is
//! `{"content": "..."}`.

use crate::convergence::{plan_change, Plan};
use crate::r#trait::{ApplyResult, ExecutionMode, HandlerError, ResourceHandler, ResourceState};
use async_trait::async_trait;
use converge_core::{Action, Category, PreferenceItem};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Handler for files under a managed root directory.
pub struct FileHandler {
    root: PathBuf,
}

impl FileHandler {
    /// Create a handler over `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory managed by this handler.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, HandlerError> {
        let relative = Path::new(key);
        let mut normal = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(_) => normal += 1,
                Component::CurDir => {}
                _ => {
                    return Err(HandlerError::Permanent(format!(
                        "file key {:?} must be relative and stay under the root",
                        key
                    )))
                }
            }
        }
        if normal == 0 {
            return Err(HandlerError::Permanent(format!("file key {:?} names no file", key)));
        }
        Ok(self.root.join(relative))
    }
}

fn content_of(item: &PreferenceItem) -> Result<&str, HandlerError> {
    item.payload
        .get("content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            HandlerError::MalformedPayload(format!(
                "file {} needs a string \"content\" field",
                item.resource_key
            ))
        })
}

#[async_trait]
impl ResourceHandler for FileHandler {
    fn category(&self) -> Category {
        Category::File
    }

    fn name(&self) -> &str {
        "file"
    }

    fn supports_update(&self) -> bool {
        false
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    fn concurrent_writes(&self) -> bool {
        true
    }

    async fn read(&self, key: &str) -> Result<ResourceState, HandlerError> {
        let path = self.resolve(key)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(ResourceState::new(key, json!({ "content": content }))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HandlerError::NotFound(key.to_string()))
            }
            Err(e) => Err(HandlerError::from_io(key, e)),
        }
    }

    async fn apply(
        &self,
        item: &PreferenceItem,
        current: Option<&ResourceState>,
    ) -> Result<ApplyResult, HandlerError> {
        let path = self.resolve(&item.resource_key)?;
        // Only `content` takes part in comparisons.
        let desired;
        let item = if matches!(item.action, Action::Create | Action::Replace) {
            let content = content_of(item)?;
            desired = PreferenceItem {
                payload: json!({ "content": content }),
                ..item.clone()
            };
            &desired
        } else {
            item
        };

        let plan = plan_change(item, current, self.supports_update())?;
        let change = plan.change();
        match plan {
            Plan::Noop => {}
            Plan::Write { value, .. } => {
                let content = value.get("content").and_then(|c| c.as_str()).unwrap_or_default();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| HandlerError::from_io(&item.resource_key, e))?;
                }
                fs::write(&path, content.as_bytes())
                    .await
                    .map_err(|e| HandlerError::from_io(&item.resource_key, e))?;
            }
            Plan::Remove => match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(HandlerError::from_io(&item.resource_key, e)),
            },
        }
        tracing::debug!(path = %path.display(), %change, "file converged");
        Ok(ApplyResult::new(change))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::Change;

    fn file_item(key: &str, action: Action, content: Option<&str>) -> PreferenceItem {
        let payload = match content {
            Some(c) => json!({ "content": c }),
            None => serde_json::Value::Null,
        };
        PreferenceItem::new(Category::File, key, action, payload)
    }

    async fn apply_read(handler: &FileHandler, item: &PreferenceItem) -> Result<ApplyResult, HandlerError> {
        let current = handler.read(&item.resource_key).await.ok();
        handler.apply(item, current.as_ref()).await
    }

    #[tokio::test]
    async fn test_create_writes_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileHandler::new(dir.path());
        let item = file_item("etc/motd", Action::Create, Some("welcome"));

        assert_eq!(apply_read(&handler, &item).await.unwrap().change, Change::Created);
        assert_eq!(std::fs::read_to_string(dir.path().join("etc/motd")).unwrap(), "welcome");
        assert!(apply_read(&handler, &item).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_create_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "user edit").unwrap();
        let handler = FileHandler::new(dir.path());

        let r = apply_read(&handler, &file_item("a.txt", Action::Create, Some("default"))).await.unwrap();
        assert!(r.is_noop());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "user edit");
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileHandler::new(dir.path());
        std::fs::write(dir.path().join("a.txt"), "old").unwrap();

        let r = apply_read(&handler, &file_item("a.txt", Action::Replace, Some("new"))).await.unwrap();
        assert_eq!(r.change, Change::Replaced);

        let del = file_item("a.txt", Action::Delete, None);
        assert_eq!(apply_read(&handler, &del).await.unwrap().change, Change::Deleted);
        assert!(!dir.path().join("a.txt").exists());
        assert!(apply_read(&handler, &del).await.unwrap().is_noop());
    }

    #[tokio::test]
    async fn test_update_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileHandler::new(dir.path());
        let result = apply_read(&handler, &file_item("a.txt", Action::Update, Some("x"))).await;
        assert_eq!(result, Err(HandlerError::UnsupportedMerge { category: Category::File }));
    }

    #[tokio::test]
    async fn test_escaping_keys_are_permanent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileHandler::new(dir.path().join("root"));
        for key in ["../outside.txt", "/etc/passwd", "a/../../b", "."] {
            let result = handler.apply(&file_item(key, Action::Create, Some("x")), None).await;
            assert!(
                matches!(result, Err(HandlerError::Permanent(_))),
                "{} -> {:?}",
                key,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let handler = FileHandler::new(dir.path());
        let item = PreferenceItem::new(Category::File, "a.txt", Action::Create, json!({"text": "x"}));
        assert!(matches!(
            handler.apply(&item, None).await,
            Err(HandlerError::MalformedPayload(_))
        ));
    }
}
