use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::models::{Branch, CommitMetadata};

use super::source::{SourceFetcher, SourceTree};

async fn run_git(args: &[&str], working_directory: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    tracing::debug!("git {}", args.join(" "));
    let output = cmd
        .output()
        .await
        .map_err(|e| OrchestratorError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::Git(format!(
            "git {} failed (exit {}): {stderr}",
            args.join(" "),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Fetches trees from a local mirror of the application repository.
/// Pull request heads come along with the mirror's `refs/pull/*`.
pub struct GitSource {
    repository: String,
    mirror: PathBuf,
    mirror_lock: tokio::sync::Mutex<()>,
    checkouts: Mutex<HashMap<String, Weak<tempfile::TempDir>>>,
}

impl GitSource {
    pub fn new(repository: impl Into<String>, cache_dir: &Path) -> Self {
        Self {
            repository: repository.into(),
            mirror: cache_dir.join("mirror.git"),
            mirror_lock: tokio::sync::Mutex::new(()),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    async fn update_mirror(&self) -> Result<()> {
        let _guard = self.mirror_lock.lock().await;
        let mirror = self.mirror.to_string_lossy();
        if self.mirror.exists() {
            run_git(&["--git-dir", &mirror, "remote", "update", "--prune"], None).await?;
        } else {
            if let Some(parent) = self.mirror.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            run_git(&["clone", "--mirror", &self.repository, &mirror], None).await?;
        }
        Ok(())
    }

    fn cached_checkout(&self, reference: &str) -> Option<Arc<tempfile::TempDir>> {
        let mut checkouts = self.checkouts.lock().ok()?;
        checkouts.retain(|_, tree| tree.strong_count() > 0);
        checkouts.get(reference).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl SourceFetcher for GitSource {
    async fn fetch(&self, branch: &Branch, reference: &str) -> Result<SourceTree> {
        if let Some(tree) = self.cached_checkout(reference) {
            return Ok(SourceTree::new(tree));
        }
        self.update_mirror().await?;
        tracing::info!(branch = %branch.label(), reference, "checking out source tree");

        let dir = tempfile::Builder::new().prefix("cdo-src-").tempdir()?;
        let target = dir.path().to_string_lossy().into_owned();
        let mirror = self.mirror.to_string_lossy();
        run_git(&["clone", "--shared", "--no-checkout", &mirror, &target], None).await?;
        run_git(&["checkout", "--detach", reference], Some(dir.path())).await?;

        let tree = Arc::new(dir);
        if let Ok(mut checkouts) = self.checkouts.lock() {
            checkouts.insert(reference.to_string(), Arc::downgrade(&tree));
        }
        Ok(SourceTree::new(tree))
    }

    async fn resolve_ref(&self, branch: &Branch, reference: &str) -> Result<String> {
        self.update_mirror().await?;
        let mirror = self.mirror.to_string_lossy();
        let spec = format!("{reference}^{{commit}}");
        run_git(&["--git-dir", &mirror, "rev-parse", "--verify", &spec], None)
            .await
            .map_err(|e| e.prefixed(&branch.label()))
    }

    async fn commit_metadata(&self, _branch: &Branch, reference: &str) -> Result<CommitMetadata> {
        let mirror = self.mirror.to_string_lossy();
        let output = run_git(
            &["--git-dir", &mirror, "show", "-s", "--format=%aI%n%cI%n%B", reference],
            None,
        )
        .await?;
        parse_metadata(&output)
    }
}

fn parse_metadata(output: &str) -> Result<CommitMetadata> {
    let mut lines = output.lines();
    let mut timestamp = |what: &str| -> Result<DateTime<Utc>> {
        let line = lines
            .next()
            .ok_or_else(|| OrchestratorError::Git(format!("missing {what} timestamp")))?;
        DateTime::parse_from_rfc3339(line.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| OrchestratorError::Git(format!("bad {what} timestamp {line:?}: {e}")))
    };
    let authored_at = timestamp("author")?;
    let committed_at = timestamp("committer")?;
    let message = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    Ok(CommitMetadata {
        authored_at,
        committed_at,
        message,
    })
}
