use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{OrchestratorError, Result};
use crate::models::Branch;
use crate::services::source::SourceFetcher;

static REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Fa-f0-9]{6,40}$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMetadata {
    pub authored_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// A fully resolved commit hash. Metadata is fetched lazily, at most once.
#[derive(Debug, Clone)]
pub struct Commit {
    reference: String,
    metadata: Arc<OnceCell<CommitMetadata>>,
}

impl Commit {
    /// Build from an already complete 40-hex ref without any lookup.
    pub fn from_full_ref(reference: &str) -> Result<Self> {
        if reference.len() != 40 || !REF_RE.is_match(reference) {
            return Err(OrchestratorError::InvalidRef(reference.to_string()));
        }
        Ok(Self {
            reference: reference.to_ascii_lowercase(),
            metadata: Arc::new(OnceCell::new()),
        })
    }

    /// Accepts 6 to 40 hex characters and resolves abbreviated refs through `source`.
    pub async fn resolve(
        branch: &Branch,
        reference: &str,
        source: &dyn SourceFetcher,
    ) -> Result<Self> {
        if !REF_RE.is_match(reference) {
            return Err(OrchestratorError::InvalidRef(reference.to_string()));
        }
        if reference.len() == 40 {
            return Self::from_full_ref(reference);
        }
        let resolved = source.resolve_ref(branch, reference).await?;
        Self::from_full_ref(resolved.trim()).map_err(|e| e.prefixed(reference))
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn short(&self) -> &str {
        &self.reference[..7]
    }

    pub async fn metadata(
        &self,
        branch: &Branch,
        source: &dyn SourceFetcher,
    ) -> Result<&CommitMetadata> {
        self.metadata
            .get_or_try_init(|| source.commit_metadata(branch, &self.reference))
            .await
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for Commit {}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::StaticSource;

    const FULL: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn full_ref_is_accepted_and_lowercased() {
        let commit = Commit::from_full_ref(&FULL.to_uppercase()).unwrap();
        assert_eq!(commit.reference(), FULL);
        assert_eq!(commit.short(), "0123456");
    }

    #[tokio::test]
    async fn short_ref_is_resolved_through_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::new(dir.path()).with_ref(FULL);
        let branch = Branch::named("shop", "master");
        let commit = Commit::resolve(&branch, "012345", &source).await.unwrap();
        assert_eq!(commit.reference(), FULL);
    }

    #[tokio::test]
    async fn invalid_refs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::new(dir.path());
        let branch = Branch::named("shop", "master");
        for bad in ["01234", "xyz123", "", &format!("{FULL}0")] {
            assert!(matches!(
                Commit::resolve(&branch, bad, &source).await,
                Err(OrchestratorError::InvalidRef(_))
            ));
        }
    }

    #[tokio::test]
    async fn metadata_is_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = StaticSource::new(dir.path());
        let branch = Branch::named("shop", "master");
        let commit = Commit::from_full_ref(FULL).unwrap();
        commit.metadata(&branch, &source).await.unwrap();
        commit.metadata(&branch, &source).await.unwrap();
        assert_eq!(source.metadata_calls(), 1);
    }
}
