//! A table of named JSON values persisted as one JSON document.

use crate::r#trait::HandlerError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};

pub(crate) type Table = BTreeMap<String, Value>;

pub(crate) struct JsonDocument {
    path: Option<PathBuf>,
    table: Mutex<Table>,
}

impl JsonDocument {
    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            table: Mutex::new(Table::new()),
        }
    }

    /// Load the document at `path`; a missing file starts empty.
    pub(crate) async fn open(path: impl AsRef<Path>) -> Result<Self, HandlerError> {
        let path = path.as_ref().to_path_buf();
        let table = match fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                HandlerError::Permanent(format!("corrupt document {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::new(),
            Err(e) => return Err(HandlerError::from_io(&path.display().to_string(), e)),
        };
        Ok(Self {
            path: Some(path),
            table: Mutex::new(table),
        })
    }

    pub(crate) async fn get(&self, key: &str) -> Option<Value> {
        self.table.lock().await.get(key).cloned()
    }

    /// Exclusive access for a read-modify-write.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().await
    }

    /// Persist `next` and only then make it the held table. On error the
    /// held table is left as it was.
    pub(crate) async fn commit(
        &self,
        held: &mut MutexGuard<'_, Table>,
        next: Table,
    ) -> Result<(), HandlerError> {
        self.save(&next).await?;
        **held = next;
        Ok(())
    }

    async fn save(&self, table: &Table) -> Result<(), HandlerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let context = path.display().to_string();
        let json = serde_json::to_string_pretty(table)
            .map_err(|e| HandlerError::Permanent(format!("{}: {}", context, e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| HandlerError::from_io(&context, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| HandlerError::from_io(&context, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| HandlerError::from_io(&context, e))
    }
}
