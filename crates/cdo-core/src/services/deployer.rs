use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{OrchestratorError, Result};
use crate::models::{AppConfig, Branch, Commit};

use super::aws::AwsCli;
use super::build::{Build, DeployedDomains, Providers};
use super::build_log::LogLine;
use super::cleanup::Cleanup;
use super::ec2::Ec2Compute;
use super::git::GitSource;
use super::lifecycle::Deployment;
use super::notify::{HookPayload, Notifier};
use super::packaging::CommandPackager;
use super::remote::SessionOptions;
use super::route53::Route53Dns;
use super::service::{BuildContext, ServiceRegistry};
use super::ssh::SshTransport;

/// Entry points for one application: deploy, undeploy, promote, redeploy.
#[derive(Clone)]
pub struct Deployer {
    providers: Providers,
    notifier: Notifier,
}

impl Deployer {
    pub fn new(providers: Providers, notifier: Notifier) -> Self {
        Self { providers, notifier }
    }

    /// Wire the command-line backed providers for `app`.
    pub fn from_config(
        app: AppConfig,
        log_tx: Option<mpsc::UnboundedSender<LogLine>>,
    ) -> Result<Self> {
        let aws = AwsCli::new(app.region.clone());
        let cache_dir = app.cache_dir();
        let providers = Providers {
            compute: Arc::new(Ec2Compute::new(aws.clone(), app.instance.clone())),
            dns: Arc::new(Route53Dns::new(aws)),
            transport: Arc::new(SshTransport::new(&app.instance.private_key)?),
            source: Arc::new(GitSource::new(&app.repository, &cache_dir)),
            packager: Arc::new(CommandPackager::new(
                app.packaging.clone(),
                cache_dir.join("dist"),
            )),
            registry: Arc::new(ServiceRegistry::with_builtins()),
            session_options: SessionOptions::default(),
            log_tx,
            app: Arc::new(app),
        };
        let notifier = Notifier::new(providers.app.hooks.clone());
        Ok(Self::new(providers, notifier))
    }

    pub fn app(&self) -> &AppConfig {
        &self.providers.app
    }

    pub fn branch(&self, label: &str) -> Result<Branch> {
        Branch::from_label(&self.providers.app.name, label)
    }

    /// Launch a fresh instance and deploy `reference` of `branch` onto it.
    pub async fn deploy(
        &self,
        branch: Branch,
        reference: &str,
        live: bool,
    ) -> Result<DeployedDomains> {
        let commit = Commit::resolve(&branch, reference, self.providers.source.as_ref()).await?;
        let payload = HookPayload::new(&branch, &commit);
        self.notifier.start(&payload).await;

        let instance = self.providers.lifecycle().create(&branch).await?;
        let log = self.providers.build_log(&branch, &commit);
        let context = BuildContext::new(self.providers.app.clone(), branch, commit, live);
        let build = Build::new(self.providers.clone(), context, instance, log);
        let deployed = build.run().await?;

        self.notifier.finish(&payload.with_domains(&deployed)).await;
        Ok(deployed)
    }

    /// Undeploy `branch`; `live` narrows to one track.
    pub async fn cleanup(&self, branch: Branch, live: Option<bool>) -> Result<Vec<String>> {
        Cleanup::new(self.providers.clone(), branch, live).run().await
    }

    /// Deploy what `label` currently runs onto the live track.
    pub async fn promote(&self, label: &str) -> Result<DeployedDomains> {
        let branch = self.branch(label)?;
        let reference = self.current_commit(label, false).await?;
        self.deploy(branch, &reference, true).await
    }

    /// Redeploy the current ordinary build of `label` on a fresh instance.
    pub async fn deploy_again(&self, label: &str) -> Result<DeployedDomains> {
        let branch = self.branch(label)?;
        let reference = self.current_commit(label, false).await?;
        self.deploy(branch, &reference, false).await
    }

    pub async fn deployments(&self) -> Result<Vec<Deployment>> {
        self.providers.lifecycle().deployments().await
    }

    /// Full commit currently deployed for `label` on one track.
    pub async fn current_commit(&self, label: &str, live: bool) -> Result<String> {
        self.providers
            .lifecycle()
            .current_commit(label, live)
            .await?
            .ok_or_else(|| OrchestratorError::NotDeployed(label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fakes::{
        self, FakeTransport, MemoryCompute, MemoryDns, StaticPackager, StaticSource,
    };
    use crate::models::instance::{TAG_BRANCH, TAG_COMMIT};
    use crate::models::{InstanceDescription, InstanceState};

    struct Fixture {
        compute: Arc<MemoryCompute>,
        deployer: Deployer,
        _source: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("deploy")).unwrap();
        std::fs::write(
            source.path().join("deploy/lb.yml"),
            "enabled: true\ntype: endpoint\n\
             dns_name: lb-1.elb.amazonaws.com\nhosted_zone_id: ZELB\n",
        )
        .unwrap();
        let compute = Arc::new(MemoryCompute::new());
        let app = fakes::app_config();
        let providers = Providers {
            compute: compute.clone(),
            dns: Arc::new(MemoryDns::new("Z1", "example.com")),
            transport: Arc::new(FakeTransport::new()),
            source: Arc::new(StaticSource::new(source.path()).with_ref(fakes::FAKE_REF)),
            packager: Arc::new(StaticPackager::new(source.path())),
            registry: Arc::new(fakes::recording_registry()),
            session_options: SessionOptions::default(),
            log_tx: None,
            app: Arc::new(app.clone()),
        };
        Fixture {
            compute,
            deployer: Deployer::new(providers, Notifier::new(app.hooks)),
            _source: source,
        }
    }

    #[tokio::test]
    async fn deploy_resolves_short_refs() {
        let fixture = fixture();
        let branch = fixture.deployer.branch("branch-foo").unwrap();
        let deployed = fixture.deployer.deploy(branch, "0123456", false).await.unwrap();
        assert_eq!(deployed["lb"], "branch-foo.shop.example.com");

        let deployments = fixture.deployer.deployments().await.unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].branch, "branch-foo");
        assert_eq!(deployments[0].commit, fakes::FAKE_REF);
        assert!(deployments[0].statuses.contains("done"));
    }

    #[tokio::test]
    async fn promote_deploys_the_current_commit_live() {
        let fixture = fixture();
        fixture.compute.insert(InstanceDescription {
            id: "i-current".into(),
            public_dns_name: Some("ec2-9.example.com".into()),
            state: InstanceState::Running,
            tags: BTreeMap::from([
                ("App".to_string(), "shop".to_string()),
                (TAG_BRANCH.to_string(), "branch-master".to_string()),
                (TAG_COMMIT.to_string(), fakes::FAKE_REF.to_string()),
                ("Status".to_string(), "done".to_string()),
            ]),
        });
        let deployed = fixture.deployer.promote("branch-master").await.unwrap();
        assert_eq!(deployed["lb"], "example.com");

        let deployments = fixture.deployer.deployments().await.unwrap();
        let live: Vec<_> = deployments.iter().filter(|d| d.live).collect();
        assert_eq!(live.len(), 1);
        assert!(fixture.compute.terminated().is_empty(), "ordinary track is kept");
    }

    #[tokio::test]
    async fn promote_without_deployment_fails() {
        let fixture = fixture();
        assert!(matches!(
            fixture.deployer.promote("branch-nowhere").await,
            Err(OrchestratorError::NotDeployed(_))
        ));
        assert!(matches!(
            fixture.deployer.deploy_again("bogus").await,
            Err(OrchestratorError::InvalidLabel(_))
        ));
    }
}
