use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Branch, CommitMetadata};

/// A checked-out source tree. The directory lives until the last clone
/// of the handle is dropped.
#[derive(Debug, Clone)]
pub struct SourceTree {
    path: PathBuf,
    _guard: Option<Arc<tempfile::TempDir>>,
}

impl SourceTree {
    pub fn new(guard: Arc<tempfile::TempDir>) -> Self {
        Self {
            path: guard.path().to_path_buf(),
            _guard: Some(guard),
        }
    }

    /// A tree whose directory is owned elsewhere and never removed.
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _guard: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Source-control access for one application repository.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Check out `reference`. Concurrent fetches of the same ref share one tree.
    async fn fetch(&self, branch: &Branch, reference: &str) -> Result<SourceTree>;

    /// Expand an abbreviated ref to the full 40-hex hash.
    async fn resolve_ref(&self, branch: &Branch, reference: &str) -> Result<String>;

    async fn commit_metadata(&self, branch: &Branch, reference: &str) -> Result<CommitMetadata>;
}
