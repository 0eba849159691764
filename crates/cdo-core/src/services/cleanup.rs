use std::sync::Arc;

use tracing::Instrument;

use crate::error::Result;
use crate::models::{Branch, Commit};

use super::build::{routing_targets, Providers};
use super::domain::DomainReconciler;
use super::service::{BuildContext, Service};

/// Undeploys one branch: unroutes its domains, uninstalls its services and
/// terminates its instances.
pub struct Cleanup {
    providers: Providers,
    branch: Branch,
    /// `None` covers both tracks.
    live: Option<bool>,
}

impl Cleanup {
    pub fn new(providers: Providers, branch: Branch, live: Option<bool>) -> Self {
        Self {
            providers,
            branch,
            live,
        }
    }

    fn tracks(&self) -> Vec<bool> {
        match self.live {
            Some(live) => vec![live],
            None => vec![false, true],
        }
    }

    /// Returns the terminated instance ids.
    pub async fn run(&self) -> Result<Vec<String>> {
        let span = tracing::info_span!("cleanup", branch = %self.branch.label());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<Vec<String>> {
        let label = self.branch.label();
        let lifecycle = self.providers.lifecycle();
        let app = &self.providers.app;

        let mut reconciler = match app.domains.zone_id.as_deref() {
            Some(zone_id) => Some(
                DomainReconciler::new(
                    self.providers.dns.clone(),
                    zone_id,
                    format!("{} cleanup {label}", app.name),
                )
                .await?,
            ),
            None => None,
        };

        let mut deployed: Vec<Arc<dyn Service>> = Vec::new();
        for live in self.tracks() {
            let Some(reference) = lifecycle.current_commit(&label, live).await? else {
                continue;
            };
            let commit = Commit::from_full_ref(&reference)?;
            let context = BuildContext::new(app.clone(), self.branch.clone(), commit, live);
            let (_tree, services) = self.providers.resolve_services(&context).await?;

            if let Some(reconciler) = reconciler.as_mut() {
                let domains = app.resolved_domains(&self.branch, live);
                for (domain, _) in routing_targets(&services, domains).await? {
                    reconciler.remove_domain(&domain).await?;
                }
            }
            deployed.extend(services);
        }

        if let Some(reconciler) = reconciler {
            reconciler.commit().await?;
        }
        for service in &deployed {
            service.uninstall().await.map_err(|e| e.prefixed(service.name()))?;
        }
        let terminated = lifecycle.terminate_branch(&label, self.live).await?;
        let count = terminated.len();
        tracing::info!("cleaned up {}: {count} instance(s)", self.branch.human_label());
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fakes::{self, FakeTransport, MemoryCompute, MemoryDns, StaticPackager, StaticSource};
    use crate::models::{InstanceDescription, InstanceState, RecordSet};
    use crate::services::remote::SessionOptions;

    const LB: &str = "enabled: true\ntype: endpoint\n\
        dns_name: lb-1.elb.amazonaws.com\nhosted_zone_id: ZELB\n";

    fn instance(id: &str, live: bool) -> InstanceDescription {
        InstanceDescription {
            id: id.into(),
            public_dns_name: None,
            state: InstanceState::Running,
            tags: BTreeMap::from([
                ("App".to_string(), "shop".to_string()),
                ("Branch".to_string(), "branch-foo".to_string()),
                ("Commit".to_string(), fakes::FAKE_REF.to_string()),
                ("Live".to_string(), if live { "live".into() } else { String::new() }),
                ("Status".to_string(), "done".to_string()),
            ]),
        }
    }

    fn providers(
        source: &std::path::Path,
        compute: Arc<MemoryCompute>,
        dns: Arc<MemoryDns>,
    ) -> Providers {
        Providers {
            app: Arc::new(fakes::app_config()),
            compute,
            dns,
            transport: Arc::new(FakeTransport::new()),
            source: Arc::new(StaticSource::new(source)),
            packager: Arc::new(StaticPackager::new(source)),
            registry: Arc::new(fakes::recording_registry()),
            session_options: SessionOptions::default(),
            log_tx: None,
        }
    }

    fn source_with_lb() -> tempfile::TempDir {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("deploy")).unwrap();
        std::fs::write(source.path().join("deploy/lb.yml"), LB).unwrap();
        source
    }

    #[tokio::test]
    async fn removes_domains_then_terminates_one_track() {
        let source = source_with_lb();
        let compute = Arc::new(MemoryCompute::new());
        compute.insert(instance("i-1", false));
        compute.insert(instance("i-2", true));
        let dns = Arc::new(MemoryDns::new("Z1", "example.com"));
        dns.insert(RecordSet::cname(
            "branch-foo.shop.example.com.",
            "dualstack.lb-1.elb.amazonaws.com",
            300,
        ));
        dns.insert(RecordSet::cname("other.example.com.", "dualstack.lb-1.elb.amazonaws.com", 300));

        let cleanup = Cleanup::new(
            providers(source.path(), compute.clone(), dns.clone()),
            Branch::named("shop", "foo"),
            Some(false),
        );
        assert_eq!(cleanup.run().await.unwrap(), vec!["i-1"]);

        let remaining: Vec<String> = dns.records().into_iter().map(|r| r.name).collect();
        assert_eq!(remaining, vec!["other.example.com."]);
        assert_eq!(dns.commits().len(), 1);
        assert_eq!(compute.terminated(), vec!["i-1"]);
    }

    #[tokio::test]
    async fn both_tracks_share_one_changeset() {
        let source = source_with_lb();
        let compute = Arc::new(MemoryCompute::new());
        compute.insert(instance("i-1", false));
        compute.insert(instance("i-2", true));
        let dns = Arc::new(MemoryDns::new("Z1", "example.com"));
        dns.insert(RecordSet::cname(
            "branch-foo.shop.example.com.",
            "dualstack.lb-1.elb.amazonaws.com",
            300,
        ));

        let cleanup = Cleanup::new(
            providers(source.path(), compute.clone(), dns.clone()),
            Branch::named("shop", "foo"),
            None,
        );
        let mut terminated = cleanup.run().await.unwrap();
        terminated.sort();
        assert_eq!(terminated, vec!["i-1", "i-2"]);
        assert_eq!(dns.commits().len(), 1);
        assert!(dns.records().is_empty());
    }

    #[tokio::test]
    async fn nothing_deployed_is_a_no_op() {
        let source = source_with_lb();
        let compute = Arc::new(MemoryCompute::new());
        let dns = Arc::new(MemoryDns::new("Z1", "example.com"));
        let cleanup = Cleanup::new(
            providers(source.path(), compute.clone(), dns.clone()),
            Branch::named("shop", "foo"),
            None,
        );
        assert!(cleanup.run().await.unwrap().is_empty());
        assert!(dns.commits().is_empty());
    }
}
