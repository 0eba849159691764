use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{OrchestratorError, Result};
use crate::models::{AppConfig, Branch, Commit, Status};

use super::build_log::{build_id, BuildLog, LogLine};
use super::compute::ComputeProvider;
use super::dns::DnsProvider;
use super::domain::DomainReconciler;
use super::lifecycle::{deployment_tags, Instance, InstanceLifecycle};
use super::packaging::{Artifact, ArtifactPackager, PackageRequest};
use super::remote::{CommandLine, RemoteSession, SessionOptions, Transport};
use super::service::{BuildContext, RoutingTarget, Service, ServiceRegistry};
use super::service_graph::ServiceGraph;
use super::source::{SourceFetcher, SourceTree};

type ServiceList = Arc<[Arc<dyn Service>]>;
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const APT_ENV: &[(&str, &str)] = &[("DEBIAN_FRONTEND", "noninteractive")];
/// `useradd` exit status for an existing user.
const USER_EXISTS: i32 = 9;
const BOOTSTRAP_STOPPED: &str = "bootstrap stopped before the service list was ready";

/// The collaborators every build and cleanup of one application shares.
#[derive(Clone)]
pub struct Providers {
    pub app: Arc<AppConfig>,
    pub compute: Arc<dyn ComputeProvider>,
    pub dns: Arc<dyn DnsProvider>,
    pub transport: Arc<dyn Transport>,
    pub source: Arc<dyn SourceFetcher>,
    pub packager: Arc<dyn ArtifactPackager>,
    pub registry: Arc<ServiceRegistry>,
    pub session_options: SessionOptions,
    pub log_tx: Option<mpsc::UnboundedSender<LogLine>>,
}

impl Providers {
    pub fn lifecycle(&self) -> InstanceLifecycle {
        InstanceLifecycle::new(&self.app.name, &self.app.instance.login, self.compute.clone())
    }

    pub fn build_log(&self, branch: &Branch, commit: &Commit) -> BuildLog {
        let build = build_id(&branch.label(), commit.short());
        match &self.log_tx {
            Some(tx) => BuildLog::new(build, tx.clone()),
            None => BuildLog::disabled(build),
        }
    }

    pub fn session(&self, instance: &Instance, log: BuildLog) -> RemoteSession {
        instance
            .session(self.transport.clone(), log)
            .with_options(self.session_options.clone())
    }

    /// Check out `commit` and resolve its enabled services in install order.
    pub async fn resolve_services(
        &self,
        context: &BuildContext,
    ) -> Result<(SourceTree, Vec<Arc<dyn Service>>)> {
        let tree = self
            .source
            .fetch(&context.branch, context.commit.reference())
            .await?;
        let graph = ServiceGraph::load(&tree.path().join(&self.app.config_dir)).await?;
        let services = graph.resolve(&self.registry, context)?;
        Ok((tree, services))
    }
}

/// Routing target of every service a configured domain names. Fails before
/// any record is touched if one of them cannot be routed to.
pub async fn routing_targets(
    services: &[Arc<dyn Service>],
    domains: impl IntoIterator<Item = (String, String)>,
) -> Result<Vec<(String, RoutingTarget)>> {
    let mut targets = Vec::new();
    for (service_name, domain) in domains {
        let service = services
            .iter()
            .find(|s| s.name() == service_name)
            .ok_or_else(|| {
                OrchestratorError::NotRoutable(format!("{service_name} is not an enabled service"))
            })?;
        let routing = service
            .domain_routing()
            .ok_or_else(|| {
                OrchestratorError::NotRoutable(format!("{service_name} does not route domains"))
            })?;
        targets.push((domain, routing.routing_target().await?));
    }
    Ok(targets)
}

/// Service name to the domain routed to it.
pub type DeployedDomains = BTreeMap<String, String>;

/// One deployment of a branch commit onto a freshly launched instance.
pub struct Build {
    providers: Providers,
    context: BuildContext,
    instance: Arc<Instance>,
    log: BuildLog,
}

impl Build {
    pub fn new(
        providers: Providers,
        context: BuildContext,
        instance: Instance,
        log: BuildLog,
    ) -> Self {
        Self {
            providers,
            context,
            instance: Arc::new(instance),
            log,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Install everything and route domains. Returns the domains routed.
    pub async fn run(&self) -> Result<DeployedDomains> {
        let span = tracing::info_span!(
            "build",
            branch = %self.context.branch.label(),
            commit = %self.context.commit.short(),
            live = self.context.live,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<DeployedDomains> {
        let app = &self.providers.app;
        self.log.info(format!(
            "deploying {} {} to {}",
            self.context.branch.human_label(),
            self.context.commit.short(),
            self.instance.id()
        ));
        let tags = deployment_tags(
            &app.name,
            &self.context.branch,
            &self.context.commit,
            self.context.live,
        );
        self.instance.set_tags(tags).await?;
        let session = Arc::new(self.providers.session(&self.instance, self.log.clone()));

        let (services_tx, services_rx) = oneshot::channel::<ServiceList>();
        let bootstrap = tokio::spawn(
            bootstrap(session.clone(), self.instance.clone(), app.clone(), services_rx)
                .in_current_span(),
        );

        let staged = match self.stage(services_tx).await {
            Ok(staged) => staged,
            Err(e) if is_bootstrap_stopped(&e) => {
                join_bootstrap(bootstrap).await?;
                return Err(e);
            }
            Err(e) => {
                bootstrap.abort();
                return Err(e);
            }
        };

        let remote_artifact = format!("/tmp/{}", staged.artifact.filename);
        let uploaded = async {
            session
                .put_directory(&staged.config_dir, &format!("/etc/{}", app.name), true)
                .await?;
            session.put_file(&staged.artifact.path, &remote_artifact, false).await
        }
        .await;
        if let Err(e) = uploaded {
            bootstrap.abort();
            return Err(e);
        }

        join_bootstrap(bootstrap).await?;

        self.install_packages(&session, &staged.services, &remote_artifact)
            .await?;
        self.install_services(&session, &staged.services).await?;
        self.instance.set_status(Status::Run).await?;

        let deployed = self.route_domains(&staged.services).await?;
        self.instance.set_status(Status::Done).await?;

        let replaced = self
            .providers
            .lifecycle()
            .terminate_replaced(
                &self.context.branch,
                &self.context.commit,
                self.context.live,
                self.instance.id(),
            )
            .await?;
        if !replaced.is_empty() {
            self.log.info(format!("terminated replaced instances {}", replaced.join(", ")));
        }
        self.log.info("deployment done");
        Ok(deployed)
    }

    /// Check out the source, publish the service list to the bootstrap task,
    /// stage the config directory and build the artifact.
    async fn stage(&self, services_tx: oneshot::Sender<ServiceList>) -> Result<Staged> {
        let (tree, services) = self.providers.resolve_services(&self.context).await?;
        let services: ServiceList = services.into();
        self.log.info(format!(
            "services: {}",
            services.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
        ));
        if services_tx.send(services.clone()).is_err() {
            return Err(OrchestratorError::Task(BOOTSTRAP_STOPPED.into()));
        }

        let app = &self.providers.app;
        let staging = tempfile::Builder::new().prefix("cdo-config-").tempdir()?;
        let config_dir = staging.path().join(&app.name);
        let source_config = tree.path().join(&app.config_dir);
        if source_config.is_dir() {
            copy_tree(&source_config, &config_dir).await?;
        } else {
            tokio::fs::create_dir_all(&config_dir).await?;
        }

        let metadata = self
            .context
            .commit
            .metadata(&self.context.branch, self.providers.source.as_ref())
            .await?;
        let label = self.context.branch.label();
        let artifact = self
            .providers
            .packager
            .build_artifact(&PackageRequest {
                source_dir: tree.path(),
                app: &app.name,
                label: &label,
                short_ref: self.context.commit.short(),
                committed_at: metadata.committed_at,
                log: &self.log,
            })
            .await?;
        Ok(Staged {
            services,
            config_dir,
            artifact,
            _staging: staging,
            _tree: tree,
        })
    }

    /// Language-level requirements of every service plus the artifact, in one install.
    async fn install_packages(
        &self,
        session: &RemoteSession,
        services: &[Arc<dyn Service>],
        artifact: &str,
    ) -> Result<()> {
        let install = &self.providers.app.install;
        let packages: BTreeSet<String> = services
            .iter()
            .flat_map(|s| s.required_language_packages())
            .collect();
        let mut argv = install.command.clone();
        argv.extend(packages);
        argv.push(artifact.to_string());
        let env: Vec<(&str, &str)> = install
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        session.check_as_root(argv, &env).await?;
        session.remove_file(artifact, false).await?;
        self.instance.set_status(Status::Installed).await
    }

    async fn install_services(
        &self,
        session: &RemoteSession,
        services: &[Arc<dyn Service>],
    ) -> Result<()> {
        let values_path = format!("/etc/{}/values.json", self.providers.app.name);
        let mut values = Map::new();
        values.insert(
            ".build".into(),
            json!({
                "commit": self.context.commit.reference(),
                "branch": self.context.branch.label(),
            }),
        );
        for service in services {
            let name = service.name();
            for command in service.pre_install() {
                session
                    .check(CommandLine::Shell(command.clone()), &[])
                    .await
                    .map_err(|e| e.prefixed(&format!("{name} pre-install")))?;
            }
            self.log.info(format!("installing {name}"));
            let installed = service.install(session).await.map_err(|e| e.prefixed(name))?;
            if let Some(installed) = installed {
                values.insert(name.to_string(), Value::Object(installed));
            }
            let rendered = serde_json::to_vec_pretty(&values)?;
            session.write_file(&values_path, &rendered, true).await?;
            for command in service.post_install() {
                session
                    .check(CommandLine::Shell(command.clone()), &[])
                    .await
                    .map_err(|e| e.prefixed(&format!("{name} post-install")))?;
            }
        }
        Ok(())
    }

    async fn route_domains(&self, services: &[Arc<dyn Service>]) -> Result<DeployedDomains> {
        let app = &self.providers.app;
        let domains = app.resolved_domains(&self.context.branch, self.context.live);
        let Some(zone_id) = app.domains.zone_id.as_deref() else {
            return Ok(DeployedDomains::new());
        };
        if domains.is_empty() {
            return Ok(DeployedDomains::new());
        }
        let targets = routing_targets(services, domains.clone()).await?;
        let comment = format!(
            "{} {} {}",
            app.name,
            self.context.branch.label(),
            self.context.commit.short()
        );
        let mut reconciler =
            DomainReconciler::new(self.providers.dns.clone(), zone_id, comment).await?;
        for (domain, target) in &targets {
            reconciler.route_domain(domain, target).await?;
        }
        reconciler.commit().await?;
        let deployed: DeployedDomains = domains
            .into_iter()
            .map(|(service, domain)| (service, domain.trim_end_matches('.').to_string()))
            .collect();
        let routed: Vec<&str> = deployed.values().map(String::as_str).collect();
        self.log.info(format!("routed {}", routed.join(", ")));
        Ok(deployed)
    }
}

/// Output of the staging line, kept alive until it is uploaded.
struct Staged {
    services: ServiceList,
    config_dir: PathBuf,
    artifact: Artifact,
    _staging: tempfile::TempDir,
    _tree: SourceTree,
}

fn is_bootstrap_stopped(e: &OrchestratorError) -> bool {
    matches!(e, OrchestratorError::Task(message) if message == BOOTSTRAP_STOPPED)
}

/// Wait for the bootstrap task and surface its own error.
async fn join_bootstrap(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .map_err(|e| OrchestratorError::Task(format!("bootstrap: {e}")))?
}

/// Prepare the host while the artifact is staged: app user, package sources,
/// then every OS package the services need once their list arrives.
async fn bootstrap(
    session: Arc<RemoteSession>,
    instance: Arc<Instance>,
    app: Arc<AppConfig>,
    services: oneshot::Receiver<ServiceList>,
) -> Result<()> {
    let guard = session.open().await?;
    let result = bootstrap_steps(&session, &app, services).await;
    guard.release().await?;
    result?;
    instance.set_status(Status::AptInstalled).await
}

async fn bootstrap_steps(
    session: &RemoteSession,
    app: &AppConfig,
    services: oneshot::Receiver<ServiceList>,
) -> Result<()> {
    let config = &app.bootstrap;
    let status = session
        .execute_as_root(
            ["useradd", "-U", "-G", config.user_groups.as_str(), "-Mr", app.name.as_str()],
            &[],
        )
        .await?;
    if status != 0 && status != USER_EXISTS {
        return Err(OrchestratorError::RemoteCommand {
            command: format!("useradd {}", app.name),
            status,
        });
    }
    session.check_as_root(["apt-get", "update"], APT_ENV).await?;

    let services = services
        .await
        .map_err(|_| OrchestratorError::ServiceListUnavailable("staging failed".into()))?;
    let mut packages: BTreeSet<String> = config.packages.iter().cloned().collect();
    let mut repositories = BTreeSet::new();
    for service in services.iter() {
        packages.extend(service.required_packages());
        repositories.extend(service.required_repositories());
    }

    if !repositories.is_empty() {
        let properties = ["apt-get", "install", "-q", "-y", "software-properties-common"];
        session.check_as_root(properties, APT_ENV).await?;
        for repository in &repositories {
            session
                .check_as_root(["add-apt-repository", "-y", repository.as_str()], APT_ENV)
                .await?;
        }
    }
    session.check_as_root(["apt-get", "update"], APT_ENV).await?;

    let installer = match &config.download_helper {
        Some(helper) => {
            session
                .check_as_root(["apt-get", "install", "-q", "-y", helper.as_str()], APT_ENV)
                .await?;
            helper.clone()
        }
        None => "apt-get".to_string(),
    };
    let mut argv = vec![installer, "install".into(), "-q".into(), "-y".into()];
    argv.extend(packages);
    session.check_as_root(argv, APT_ENV).await
}

fn copy_tree<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(to).await?;
        let mut entries = tokio::fs::read_dir(from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_tree(&entry.path(), &target).await?;
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}
