use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};

static NAMED_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^branch-(.+)$").unwrap());

static PULL_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pull-([1-9]\d*)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchKind {
    Named(String),
    PullRequest(u64),
}

/// A deployable line of work of one application: a plain branch or the
/// head of a pull request. Equality and hashing go through [`Branch::label`].
#[derive(Debug, Clone)]
pub struct Branch {
    app: String,
    kind: BranchKind,
}

impl Branch {
    pub fn named(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            kind: BranchKind::Named(name.into()),
        }
    }

    pub fn pull_request(app: impl Into<String>, number: u64) -> Self {
        Self {
            app: app.into(),
            kind: BranchKind::PullRequest(number),
        }
    }

    /// Reverse lookup from a label produced by [`Branch::label`].
    pub fn from_label(app: impl Into<String>, label: &str) -> Result<Self> {
        if let Some(caps) = PULL_LABEL_RE.captures(label) {
            let number = caps[1]
                .parse()
                .map_err(|_| OrchestratorError::InvalidLabel(label.to_string()))?;
            return Ok(Self::pull_request(app, number));
        }
        if let Some(caps) = NAMED_LABEL_RE.captures(label) {
            return Ok(Self::named(app, caps[1].replace('-', "_")));
        }
        Err(OrchestratorError::InvalidLabel(label.to_string()))
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn kind(&self) -> &BranchKind {
        &self.kind
    }

    pub fn name(&self) -> String {
        match &self.kind {
            BranchKind::Named(name) => name.clone(),
            BranchKind::PullRequest(number) => format!("pull/{number}"),
        }
    }

    pub fn pull_request_number(&self) -> Option<u64> {
        match self.kind {
            BranchKind::PullRequest(number) => Some(number),
            BranchKind::Named(_) => None,
        }
    }

    /// Identifier safe for subdomains and paths, e.g. `branch-foo-bar` or `pull-42`.
    pub fn label(&self) -> String {
        match &self.kind {
            BranchKind::Named(name) => format!("branch-{}", name.replace('_', "-")),
            BranchKind::PullRequest(number) => format!("pull-{number}"),
        }
    }

    /// Same as [`Branch::label`] with underscores, for database names.
    pub fn label_underscored(&self) -> String {
        self.label().replace('-', "_")
    }

    pub fn human_label(&self) -> String {
        match &self.kind {
            BranchKind::Named(name) => format!("branch {name}"),
            BranchKind::PullRequest(number) => format!("pull request #{number}"),
        }
    }
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.label() == other.label()
    }
}

impl Eq for Branch {}

impl Hash for Branch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label().hash(state);
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
