use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::{OrchestratorError, Result};
use crate::models::ServiceManifest;

use super::service::{BuildContext, Service, ServiceRegistry, ServiceSpec};

static MANIFEST_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9_]{2,50})\.yml$").unwrap());

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Enabled service manifests of one source tree.
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    manifests: Vec<(String, ServiceManifest)>,
}

impl ServiceGraph {
    /// Read every `<name>.yml` in `dir`, in listing order. A missing
    /// directory means no services.
    pub async fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            tracing::warn!("no service manifest directory at {}", dir.display());
            return Ok(Self::default());
        }
        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(caps) = MANIFEST_FILENAME_RE.captures(&filename) else {
                continue;
            };
            let contents = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|e| OrchestratorError::from(e).prefixed(&filename))?;
            let manifest: ServiceManifest = serde_yaml::from_str(&contents)
                .map_err(|e| OrchestratorError::from(e).prefixed(&filename))?;
            manifests.push((caps[1].to_string(), manifest));
        }
        Ok(Self::from_manifests(manifests))
    }

    /// Keep only enabled entries; disabled ones cannot be depended upon.
    pub fn from_manifests(manifests: impl IntoIterator<Item = (String, ServiceManifest)>) -> Self {
        Self {
            manifests: manifests.into_iter().filter(|(_, m)| m.enabled).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.manifests.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    /// Names in install order: every service after everything it depends on.
    pub fn order(&self) -> Result<Vec<String>> {
        let index: HashMap<&str, &ServiceManifest> =
            self.manifests.iter().map(|(n, m)| (n.as_str(), m)).collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut order = Vec::with_capacity(self.manifests.len());
        let mut path = Vec::new();
        for (name, _) in &self.manifests {
            visit(name, &index, &mut marks, &mut path, &mut order)?;
        }
        Ok(order)
    }

    /// Construct the services in install order.
    pub fn resolve(
        &self,
        registry: &ServiceRegistry,
        context: &BuildContext,
    ) -> Result<Vec<Arc<dyn Service>>> {
        let by_name: HashMap<&str, &ServiceManifest> =
            self.manifests.iter().map(|(n, m)| (n.as_str(), m)).collect();
        let mut services = Vec::with_capacity(self.manifests.len());
        for name in self.order()? {
            let manifest = by_name[name.as_str()].clone();
            let service =
                construct(&name, manifest, registry, context).map_err(|e| e.prefixed(&name))?;
            services.push(service);
        }
        Ok(services)
    }
}

fn construct(
    name: &str,
    manifest: ServiceManifest,
    registry: &ServiceRegistry,
    context: &BuildContext,
) -> Result<Arc<dyn Service>> {
    if manifest.service_type.is_empty() {
        return Err(OrchestratorError::InvalidManifest("type is required".into()));
    }
    let type_name = manifest.service_type.clone();
    let spec = ServiceSpec::new(name, manifest, context.clone())?;
    registry.construct(&type_name, spec)
}

fn visit<'a>(
    name: &'a str,
    index: &HashMap<&'a str, &'a ServiceManifest>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(name.to_string());
            return Err(OrchestratorError::DependencyCycle(cycle));
        }
        None => {}
    }
    marks.insert(name, Mark::Visiting);
    path.push(name);
    let manifest = index[name];
    for dependency in &manifest.depends {
        let Some((&dep_name, _)) = index.get_key_value(dependency.as_str()) else {
            return Err(OrchestratorError::UnknownDependency(dependency.clone()).prefixed(name));
        };
        visit(dep_name, index, marks, path, order)?;
    }
    path.pop();
    marks.insert(name, Mark::Done);
    order.push(name.to_string());
    Ok(())
}
