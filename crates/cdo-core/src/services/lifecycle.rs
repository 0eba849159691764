use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::Result;
use crate::models::instance::{
    LIVE_VALUE, TAG_APP, TAG_BRANCH, TAG_COMMIT, TAG_LIVE, TAG_NAME, TAG_STATUS,
};
use crate::models::{Branch, Commit, InstanceDescription, InstanceFilter, Status};

use super::build_log::BuildLog;
use super::compute::ComputeProvider;
use super::remote::{RemoteSession, Transport};

/// A compute instance together with its login and a local copy of its tags.
/// Tag changes go to the provider first and are cached only on success.
pub struct Instance {
    id: String,
    login: String,
    compute: Arc<dyn ComputeProvider>,
    tags: RwLock<BTreeMap<String, String>>,
}

impl Instance {
    pub fn new(
        description: InstanceDescription,
        login: impl Into<String>,
        compute: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            id: description.id,
            login: login.into(),
            compute,
            tags: RwLock::new(description.tags),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tag(&self, key: &str) -> Option<String> {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.tags.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn set_tags(&self, tags: BTreeMap<String, String>) -> Result<()> {
        self.compute.tag(&self.id, &tags).await?;
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tags);
        Ok(())
    }

    pub async fn set_status(&self, status: Status) -> Result<()> {
        tracing::info!(instance = %self.id, "status: {status}");
        self.set_tags(BTreeMap::from([(TAG_STATUS.to_string(), status.to_string())]))
            .await
    }

    pub fn session(&self, transport: Arc<dyn Transport>, log: BuildLog) -> RemoteSession {
        RemoteSession::new(&self.id, &self.login, self.compute.clone(), transport, log)
    }
}

/// Tags a build writes when it starts.
pub fn deployment_tags(
    app: &str,
    branch: &Branch,
    commit: &Commit,
    live: bool,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TAG_NAME.to_string(), format!("{app} {} {}", branch.label(), commit.short())),
        (TAG_APP.to_string(), app.to_string()),
        (TAG_BRANCH.to_string(), branch.label()),
        (TAG_COMMIT.to_string(), commit.reference().to_string()),
        (TAG_LIVE.to_string(), if live { LIVE_VALUE.to_string() } else { String::new() }),
        (TAG_STATUS.to_string(), Status::Started.to_string()),
    ])
}

/// One branch/commit/track combination currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub branch: String,
    pub commit: String,
    pub live: bool,
    pub instances: Vec<String>,
    pub statuses: BTreeSet<String>,
}

/// Ids of instances of `label` on the same track as `live` running a
/// different commit, excluding `keep`.
pub fn replaced_instances(
    candidates: &[InstanceDescription],
    label: &str,
    commit: &str,
    live: bool,
    keep: &str,
) -> Vec<String> {
    candidates
        .iter()
        .filter(|i| i.id != keep)
        .filter(|i| i.tag(TAG_BRANCH) == Some(label))
        .filter(|i| i.tag(TAG_COMMIT) != Some(commit))
        .filter(|i| i.is_live() == live)
        .map(|i| i.id.clone())
        .collect()
}

/// Queries and retires the instances of one application.
pub struct InstanceLifecycle {
    app: String,
    login: String,
    compute: Arc<dyn ComputeProvider>,
}

impl InstanceLifecycle {
    pub fn new(
        app: impl Into<String>,
        login: impl Into<String>,
        compute: Arc<dyn ComputeProvider>,
    ) -> Self {
        Self {
            app: app.into(),
            login: login.into(),
            compute,
        }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeProvider> {
        &self.compute
    }

    /// Launch a fresh instance for the app.
    pub async fn create(&self, branch: &Branch) -> Result<Instance> {
        let tags = BTreeMap::from([
            (TAG_NAME.to_string(), format!("{} {}", self.app, branch.label())),
            (TAG_APP.to_string(), self.app.clone()),
        ]);
        let description = self.compute.create_instance(&tags).await?;
        tracing::info!(instance = %description.id, branch = %branch.label(), "launched instance");
        Ok(Instance::new(description, &self.login, self.compute.clone()))
    }

    pub async fn instances(&self, label: Option<&str>) -> Result<Vec<InstanceDescription>> {
        let filter = match label {
            Some(label) => InstanceFilter::branch(&self.app, label),
            None => InstanceFilter::app(&self.app),
        };
        self.compute.list_instances(&filter).await
    }

    /// Terminate what a successful deploy of `commit` replaces.
    pub async fn terminate_replaced(
        &self,
        branch: &Branch,
        commit: &Commit,
        live: bool,
        keep: &str,
    ) -> Result<Vec<String>> {
        let label = branch.label();
        let candidates = self.instances(Some(&label)).await?;
        let ids = replaced_instances(&candidates, &label, commit.reference(), live, keep);
        if !ids.is_empty() {
            tracing::info!(branch = %label, "terminating replaced instances {ids:?}");
            self.compute.terminate(&ids).await?;
        }
        Ok(ids)
    }

    /// Terminate every instance of `label`; `live` narrows to one track.
    pub async fn terminate_branch(&self, label: &str, live: Option<bool>) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .instances(Some(label))
            .await?
            .into_iter()
            .filter(|i| live.is_none_or(|live| i.is_live() == live))
            .map(|i| i.id)
            .collect();
        if !ids.is_empty() {
            tracing::info!(branch = %label, "terminating instances {ids:?}");
            self.compute.terminate(&ids).await?;
        }
        Ok(ids)
    }

    pub async fn deployments(&self) -> Result<Vec<Deployment>> {
        let mut grouped: BTreeMap<(String, String, bool), Deployment> = BTreeMap::new();
        for instance in self.instances(None).await? {
            let (Some(branch), Some(commit)) = (instance.tag(TAG_BRANCH), instance.tag(TAG_COMMIT))
            else {
                continue;
            };
            let live = instance.is_live();
            let key = (branch.to_string(), commit.to_string(), live);
            let deployment = grouped.entry(key).or_insert_with(|| Deployment {
                branch: branch.to_string(),
                commit: commit.to_string(),
                live,
                instances: Vec::new(),
                statuses: BTreeSet::new(),
            });
            deployment.instances.push(instance.id.clone());
            if let Some(status) = instance.tag(TAG_STATUS) {
                deployment.statuses.insert(status.to_string());
            }
        }
        Ok(grouped.into_values().collect())
    }

    /// The commit `label` runs on the given track, preferring finished builds.
    pub async fn current_commit(&self, label: &str, live: bool) -> Result<Option<String>> {
        let instances = self.instances(Some(label)).await?;
        let on_track: Vec<&InstanceDescription> =
            instances.iter().filter(|i| i.is_live() == live).collect();
        let done = on_track
            .iter()
            .find(|i| i.tag(TAG_STATUS) == Some(Status::Done.as_str()));
        Ok(done
            .or_else(|| on_track.first())
            .and_then(|i| i.tag(TAG_COMMIT))
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryCompute;
    use crate::models::InstanceState;

    const AAA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BBB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn tagged(id: &str, branch: &str, commit: &str, live: &str) -> InstanceDescription {
        InstanceDescription {
            id: id.into(),
            public_dns_name: None,
            state: InstanceState::Running,
            tags: BTreeMap::from([
                (TAG_APP.to_string(), "shop".to_string()),
                (TAG_BRANCH.to_string(), branch.to_string()),
                (TAG_COMMIT.to_string(), commit.to_string()),
                (TAG_LIVE.to_string(), live.to_string()),
            ]),
        }
    }

    #[test]
    fn only_old_commit_on_same_track_is_replaced() {
        let candidates = vec![
            tagged("i-old", "branch-foo", AAA, ""),
            tagged("i-new", "branch-foo", BBB, ""),
            tagged("i-live", "branch-foo", AAA, "live"),
            tagged("i-other", "branch-bar", AAA, ""),
        ];
        let ids = replaced_instances(&candidates, "branch-foo", BBB, false, "i-new");
        assert_eq!(ids, vec!["i-old"]);
    }

    #[tokio::test]
    async fn terminate_replaced_after_deploy() {
        let compute = Arc::new(MemoryCompute::new());
        compute.insert(tagged("i-old", "branch-foo", AAA, ""));
        compute.insert(tagged("i-new", "branch-foo", BBB, ""));
        let lifecycle = InstanceLifecycle::new("shop", "ubuntu", compute.clone());
        let branch = Branch::named("shop", "foo");
        let commit = Commit::from_full_ref(BBB).unwrap();
        let ids = lifecycle.terminate_replaced(&branch, &commit, false, "i-new").await.unwrap();
        assert_eq!(ids, vec!["i-old"]);
        assert_eq!(compute.terminated(), vec!["i-old"]);
    }

    #[tokio::test]
    async fn tags_are_cached_after_provider_accepts_them() {
        let compute = Arc::new(MemoryCompute::new());
        compute.insert_running("i-1", "ec2-1.example.com");
        let description = compute.description("i-1").unwrap();
        let instance = Instance::new(description, "ubuntu", compute.clone());
        instance.set_status(Status::AptInstalled).await.unwrap();
        assert_eq!(instance.tag(TAG_STATUS).as_deref(), Some("apt-installed"));
        assert_eq!(compute.description("i-1").unwrap().tag(TAG_STATUS), Some("apt-installed"));

        compute.fail_tagging(true);
        assert!(instance.set_status(Status::Done).await.is_err());
        assert_eq!(instance.tag(TAG_STATUS).as_deref(), Some("apt-installed"));
    }

    #[tokio::test]
    async fn deployments_group_by_branch_commit_and_track() {
        let compute = Arc::new(MemoryCompute::new());
        compute.insert(tagged("i-1", "branch-foo", AAA, ""));
        compute.insert(tagged("i-2", "branch-foo", AAA, "live"));
        compute.insert(tagged("i-3", "pull-7", BBB, ""));
        let lifecycle = InstanceLifecycle::new("shop", "ubuntu", compute);
        let deployments = lifecycle.deployments().await.unwrap();
        assert_eq!(deployments.len(), 3);
        assert_eq!(
            lifecycle.current_commit("branch-foo", true).await.unwrap().as_deref(),
            Some(AAA)
        );
        assert_eq!(lifecycle.current_commit("branch-bar", false).await.unwrap(), None);
    }
}
