//! Bundle sources.

use async_trait::async_trait;
use converge_core::PolicyBundle;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Errors raised while loading bundles.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Directory or file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not a valid bundle (including targeting syntax errors)
    #[error("invalid bundle {path}: {source}")]
    Parse {
        /// File parsed
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Delivers the current set of policy bundles.
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Load every bundle.
    async fn load(&self) -> Result<Vec<PolicyBundle>, LoadError>;
}

/// Bundles held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticBundleSource {
    bundles: Vec<PolicyBundle>,
}

impl StaticBundleSource {
    /// Create a source over `bundles`.
    pub fn new(bundles: Vec<PolicyBundle>) -> Self {
        Self { bundles }
    }
}

#[async_trait]
impl BundleSource for StaticBundleSource {
    async fn load(&self) -> Result<Vec<PolicyBundle>, LoadError> {
        Ok(self.bundles.clone())
    }
}

/// One bundle per `*.json` file in a directory, in file-name order.
#[derive(Debug, Clone)]
pub struct DirectoryBundleSource {
    dir: PathBuf,
}

impl DirectoryBundleSource {
    /// Create a source over `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl BundleSource for DirectoryBundleSource {
    async fn load(&self) -> Result<Vec<PolicyBundle>, LoadError> {
        let mut paths = Vec::new();
        let mut rd = fs::read_dir(&self.dir).await.map_err(io_error(&self.dir))?;
        while let Some(entry) = rd.next_entry().await.map_err(io_error(&self.dir))? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut bundles = Vec::with_capacity(paths.len());
        for path in paths {
            let json = fs::read_to_string(&path).await.map_err(io_error(&path))?;
            let bundle: PolicyBundle = serde_json::from_str(&json)
                .map_err(|source| LoadError::Parse { path: path.clone(), source })?;
            tracing::debug!(bundle = %bundle.id, path = %path.display(), "loaded bundle");
            bundles.push(bundle);
        }
        Ok(bundles)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LoadError {
    let path = path.to_path_buf();
    move |source| LoadError::Io { path, source }
}
