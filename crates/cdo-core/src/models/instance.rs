use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const TAG_NAME: &str = "Name";
pub const TAG_APP: &str = "App";
pub const TAG_BRANCH: &str = "Branch";
pub const TAG_COMMIT: &str = "Commit";
pub const TAG_LIVE: &str = "Live";
pub const TAG_STATUS: &str = "Status";

pub const LIVE_VALUE: &str = "live";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Other(String),
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.as_str().to_string()
    }
}

impl InstanceState {
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build progress milestones, written to the `Status` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Started,
    AptInstalled,
    Installed,
    Run,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AptInstalled => "apt-installed",
            Self::Installed => "installed",
            Self::Run => "run",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a compute instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescription {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_dns_name: Option<String>,
    pub state: InstanceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl InstanceDescription {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn is_live(&self) -> bool {
        self.tag(TAG_LIVE) == Some(LIVE_VALUE)
    }
}

/// Selects instances by tag. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub app: Option<String>,
    pub branch_label: Option<String>,
}

impl InstanceFilter {
    pub fn app(app: &str) -> Self {
        Self {
            app: Some(app.to_string()),
            branch_label: None,
        }
    }

    pub fn branch(app: &str, label: &str) -> Self {
        Self {
            app: Some(app.to_string()),
            branch_label: Some(label.to_string()),
        }
    }

    pub fn matches(&self, instance: &InstanceDescription) -> bool {
        if instance.state == InstanceState::Terminated {
            return false;
        }
        let app_ok = self
            .app
            .as_deref()
            .is_none_or(|app| instance.tag(TAG_APP) == Some(app));
        let branch_ok = self
            .branch_label
            .as_deref()
            .is_none_or(|label| instance.tag(TAG_BRANCH) == Some(label));
        app_ok && branch_ok
    }
}
