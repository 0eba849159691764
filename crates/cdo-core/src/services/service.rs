use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};
use crate::models::{is_valid_service_name, AliasTarget, AppConfig, Branch, Commit, ServiceManifest};

use super::plugins;
use super::remote::RemoteSession;

/// Config-value mapping a service returns from `install`.
pub type InstallValues = Map<String, Value>;

/// What every service of one build is bound to.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub app: Arc<AppConfig>,
    pub branch: Branch,
    pub commit: Commit,
    pub live: bool,
}

impl BuildContext {
    pub fn new(app: Arc<AppConfig>, branch: Branch, commit: Commit, live: bool) -> Self {
        Self {
            app,
            branch,
            commit,
            live,
        }
    }
}

/// Everything a plugin constructor gets: the build binding plus the
/// manifest entry with its name checked.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub context: BuildContext,
    pub config: Map<String, Value>,
    pub required_packages: BTreeSet<String>,
    pub required_repositories: BTreeSet<String>,
    pub required_language_packages: BTreeSet<String>,
    pub pre_install: Vec<String>,
    pub post_install: Vec<String>,
}

impl ServiceSpec {
    pub fn new(name: &str, manifest: ServiceManifest, context: BuildContext) -> Result<Self> {
        if !is_valid_service_name(name) {
            return Err(OrchestratorError::InvalidName(format!("{name:?}")));
        }
        Ok(Self {
            name: name.to_string(),
            context,
            config: manifest.config,
            required_packages: manifest.required_packages,
            required_repositories: manifest.required_repositories,
            required_language_packages: manifest.required_language_packages,
            pre_install: manifest.pre_install,
            post_install: manifest.post_install,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.context.app.name
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// A required string option; a missing or mistyped one is a manifest error.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.config.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(OrchestratorError::InvalidManifest(format!(
                "{key} must be a string, not {other}"
            ))),
            None => Err(OrchestratorError::InvalidManifest(format!("{key} is required"))),
        }
    }
}

/// Endpoint identity a domain gets pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    pub dns_name: String,
    pub hosted_zone_id: String,
}

impl RoutingTarget {
    /// Alias target for an apex record: `A` uses the name itself, `AAAA` its `ipv6.` form.
    pub fn alias_for(&self, record_type: &str) -> AliasTarget {
        let dns_name = if record_type == "AAAA" {
            format!("ipv6.{}", self.dns_name)
        } else {
            self.dns_name.clone()
        };
        AliasTarget::new(&self.hosted_zone_id, dns_name)
    }

    /// CNAME value for non-apex names.
    pub fn dualstack(&self) -> String {
        format!("dualstack.{}", self.dns_name)
    }
}

/// Capability of services that domains can be routed to.
#[async_trait]
pub trait DomainRouting: Send + Sync {
    async fn routing_target(&self) -> Result<RoutingTarget>;
}

/// A deployable unit. `install` runs exactly once per deployment.
#[async_trait]
pub trait Service: Send + Sync {
    fn spec(&self) -> &ServiceSpec;

    fn name(&self) -> &str {
        &self.spec().name
    }

    fn required_packages(&self) -> BTreeSet<String> {
        self.spec().required_packages.clone()
    }

    fn required_repositories(&self) -> BTreeSet<String> {
        self.spec().required_repositories.clone()
    }

    fn required_language_packages(&self) -> BTreeSet<String> {
        self.spec().required_language_packages.clone()
    }

    fn pre_install(&self) -> &[String] {
        &self.spec().pre_install
    }

    fn post_install(&self) -> &[String] {
        &self.spec().post_install
    }

    async fn install(&self, session: &RemoteSession) -> Result<Option<InstallValues>>;

    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    fn domain_routing(&self) -> Option<&dyn DomainRouting> {
        None
    }
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("name", &self.name()).finish()
    }
}

/// Directories every service gets before its own install steps:
/// `/etc/<app>/<svc>`, `/var/lib/<app>/<svc>`, `/var/run/<app>`, owned by the app user.
pub async fn prepare_directories(session: &RemoteSession, spec: &ServiceSpec) -> Result<()> {
    let app = spec.app_name();
    let etc = format!("/etc/{app}/{}", spec.name);
    let lib = format!("/var/lib/{app}/{}", spec.name);
    let run = format!("/var/run/{app}");
    session
        .check_as_root(["mkdir", "-p", etc.as_str(), lib.as_str(), run.as_str()], &[])
        .await?;
    let owner = format!("{app}:{app}");
    let chown = ["chown", "-R", owner.as_str(), etc.as_str(), lib.as_str(), run.as_str()];
    session.check_as_root(chown, &[]).await
}

pub type ServiceConstructor = Arc<dyn Fn(ServiceSpec) -> Result<Arc<dyn Service>> + Send + Sync>;

/// Service type name to constructor.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    constructors: HashMap<String, ServiceConstructor>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `daemon`, `postgres` and `endpoint`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("daemon", |spec| Ok(Arc::new(plugins::DaemonService::new(spec)?)));
        registry.register("postgres", |spec| Ok(Arc::new(plugins::PostgresService::new(spec)?)));
        registry.register("endpoint", |spec| Ok(Arc::new(plugins::EndpointService::new(spec)?)));
        registry
    }

    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(ServiceSpec) -> Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    pub fn construct(&self, type_name: &str, spec: ServiceSpec) -> Result<Arc<dyn Service>> {
        let constructor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| OrchestratorError::UnknownServiceType(format!("{type_name:?}")))?;
        constructor(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes;

    #[test]
    fn spec_rejects_bad_names() {
        let context = fakes::build_context("master", false);
        let err = ServiceSpec::new("Bad-Name", ServiceManifest::default(), context).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidName(_)));
    }

    #[test]
    fn require_str_reports_type_errors() {
        let context = fakes::build_context("master", false);
        let mut manifest = ServiceManifest::default();
        manifest.config.insert("command".into(), Value::from(3));
        let spec = ServiceSpec::new("web", manifest, context).unwrap();
        assert!(matches!(spec.require_str("command"), Err(OrchestratorError::InvalidManifest(_))));
        assert!(matches!(spec.require_str("missing"), Err(OrchestratorError::InvalidManifest(_))));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let context = fakes::build_context("master", false);
        let spec = ServiceSpec::new("web", ServiceManifest::default(), context).unwrap();
        let registry = ServiceRegistry::with_builtins();
        assert!(registry.contains("daemon"));
        assert!(matches!(
            registry.construct("nginx", spec),
            Err(OrchestratorError::UnknownServiceType(_))
        ));
    }

    #[test]
    fn routing_target_forms() {
        let target = RoutingTarget {
            dns_name: "lb-1.elb.amazonaws.com".into(),
            hosted_zone_id: "ZELB".into(),
        };
        assert_eq!(target.alias_for("A").dns_name, "lb-1.elb.amazonaws.com");
        assert_eq!(target.alias_for("AAAA").dns_name, "ipv6.lb-1.elb.amazonaws.com");
        assert_eq!(target.dualstack(), "dualstack.lb-1.elb.amazonaws.com");
    }
}
