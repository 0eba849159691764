use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::models::{Branch, Commit, HookConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchPayload {
    pub name: String,
    pub label: String,
    pub human_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitPayload {
    #[serde(rename = "ref")]
    pub reference: String,
    pub short_ref: String,
}

/// Body POSTed to start and finish hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookPayload {
    pub branch: BranchPayload,
    pub commit: CommitPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_domains: Option<BTreeMap<String, String>>,
}

impl HookPayload {
    pub fn new(branch: &Branch, commit: &Commit) -> Self {
        Self {
            branch: BranchPayload {
                name: branch.name(),
                label: branch.label(),
                human_label: branch.human_label(),
            },
            commit: CommitPayload {
                reference: commit.reference().to_string(),
                short_ref: commit.short().to_string(),
            },
            deployed_domains: None,
        }
    }

    /// Attach the service to domain mapping of a finished build.
    pub fn with_domains(mut self, domains: &BTreeMap<String, String>) -> Self {
        self.deployed_domains = Some(
            domains
                .iter()
                .map(|(service, domain)| {
                    (service.clone(), domain.trim_end_matches('.').to_string())
                })
                .collect(),
        );
        self
    }
}

/// Posts build notifications. Failures are logged, never returned.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    hooks: HookConfig,
}

impl Notifier {
    pub fn new(hooks: HookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, hooks }
    }

    pub async fn start(&self, payload: &HookPayload) {
        self.post_all(&self.hooks.start, payload).await;
    }

    pub async fn finish(&self, payload: &HookPayload) {
        self.post_all(&self.hooks.finish, payload).await;
    }

    async fn post_all(&self, urls: &[String], payload: &HookPayload) {
        for url in urls {
            if let Err(e) = self.post(url, payload).await {
                tracing::warn!("{e}");
            }
        }
    }

    async fn post(&self, url: &str, payload: &HookPayload) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::Notify(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Notify(format!("{url}: status {}", response.status())));
        }
        tracing::debug!("notified {url}");
        Ok(())
    }
}
