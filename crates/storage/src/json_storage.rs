//! JSON file state store.
//!
//! One file per record under `<root>/records/<target>/`, named
//! `<category>-<hash>.json` where `<hash>` is the first 16 hex digits of the
//! SHA-256 of the resource key. Writes go to a temporary file that is then
//! renamed over the record, so a crash never leaves a torn record.

use crate::lock::KeyedLocks;
use crate::{Result, StateStore, StorageError};
use async_trait::async_trait;
use converge_core::{AppliedItemRecord, RecordKey, TargetId};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// File-based JSON state store.
pub struct JsonStateStore {
    root: PathBuf,
    locks: KeyedLocks<RecordKey>,
}

impl JsonStateStore {
    /// Create the store, making `<root>/records` if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("records")).await?;
        Ok(Self {
            root,
            locks: KeyedLocks::new(),
        })
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    fn target_dir(&self, target: &TargetId) -> PathBuf {
        self.records_dir().join(target.as_str())
    }

    fn record_path(&self, key: &RecordKey) -> PathBuf {
        let digest = Sha256::digest(key.resource_key.as_bytes());
        let hex = format!("{:x}", digest);
        self.target_dir(&key.target)
            .join(format!("{}-{}.json", key.category, &hex[..16]))
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn get_record(&self, key: &RecordKey) -> Result<Option<AppliedItemRecord>> {
        let record: Option<AppliedItemRecord> = read_json(&self.record_path(key)).await?;
        // Guard against a hash prefix collision between two keys.
        Ok(record.filter(|r| r.resource_key == key.resource_key))
    }

    async fn put_record(&self, record: &AppliedItemRecord) -> Result<()> {
        let key = record.key();
        let _guard = self.locks.lock(&key).await;
        let path = self.record_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(record)?;
        write_atomic(&path, json.as_bytes()).await?;
        tracing::debug!(record = %key, path = %path.display(), "record written");
        Ok(())
    }

    async fn delete_record(&self, key: &RecordKey) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_records(&self, target: &TargetId) -> Result<Vec<AppliedItemRecord>> {
        let mut records: Vec<AppliedItemRecord> = list_dir(&self.target_dir(target)).await?;
        records.sort_by(|a, b| {
            (a.category, &a.resource_key).cmp(&(b.category, &b.resource_key))
        });
        Ok(records)
    }

    async fn list_targets(&self) -> Result<Vec<TargetId>> {
        let mut targets = Vec::new();
        let mut rd = fs::read_dir(self.records_dir()).await?;
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(TargetId::new) {
                Some(Ok(target)) => targets.push(target),
                _ => tracing::warn!(dir = ?name, "ignoring non-target directory in state store"),
            }
        }
        targets.sort();
        Ok(targets)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::Other(format!("invalid record path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(items)
}
