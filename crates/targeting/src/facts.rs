//! Target fact providers.

use async_trait::async_trait;
use converge_core::{Facts, TargetId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Errors raised while fetching facts.
#[derive(Debug, thiserror::Error)]
pub enum FactError {
    /// Provider has no facts for this target
    #[error("unknown target: {0}")]
    UnknownTarget(TargetId),

    /// I/O error reading facts
    #[error("failed to read facts from {path}: {source}")]
    Io {
        /// File read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Facts file is not a JSON object of facts
    #[error("malformed facts in {path}: {source}")]
    Parse {
        /// File read
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Supplies the facts of a target at cycle start.
#[async_trait]
pub trait FactProvider: Send + Sync {
    /// Fetch the current facts of `target`.
    async fn get_facts(&self, target: &TargetId) -> Result<Facts, FactError>;
}

/// In-memory facts, keyed by target.
#[derive(Debug, Clone, Default)]
pub struct StaticFactProvider {
    facts: HashMap<TargetId, Facts>,
}

impl StaticFactProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the facts of a target.
    pub fn with_target(mut self, target: TargetId, facts: Facts) -> Self {
        self.insert(target, facts);
        self
    }

    /// Add or replace the facts of a target.
    pub fn insert(&mut self, target: TargetId, facts: Facts) {
        self.facts.insert(target, facts);
    }
}

#[async_trait]
impl FactProvider for StaticFactProvider {
    async fn get_facts(&self, target: &TargetId) -> Result<Facts, FactError> {
        self.facts
            .get(target)
            .cloned()
            .ok_or_else(|| FactError::UnknownTarget(target.clone()))
    }
}

/// Reads `<dir>/<target>.json`, a JSON object of facts.
#[derive(Debug, Clone)]
pub struct JsonFactProvider {
    dir: PathBuf,
}

impl JsonFactProvider {
    /// Create a provider over `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn facts_path(&self, target: &TargetId) -> PathBuf {
        self.dir.join(format!("{}.json", target))
    }
}

#[async_trait]
impl FactProvider for JsonFactProvider {
    async fn get_facts(&self, target: &TargetId) -> Result<Facts, FactError> {
        let path = self.facts_path(target);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FactError::UnknownTarget(target.clone()))
            }
            Err(source) => return Err(FactError::Io { path, source }),
        };
        let facts = serde_json::from_str(&json).map_err(|source| FactError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(target_id = %target, path = %path.display(), "loaded facts");
        Ok(facts)
    }
}
