use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::services::remote::RemoteSession;
use crate::services::service::{
    prepare_directories, DomainRouting, InstallValues, RoutingTarget, Service, ServiceSpec,
};

/// An externally managed load balancer that domains are routed to. An
/// optional `register_command` attaches the instance to it.
pub struct EndpointService {
    spec: ServiceSpec,
    target: RoutingTarget,
    register_command: Option<String>,
}

impl EndpointService {
    pub fn new(spec: ServiceSpec) -> Result<Self> {
        let target = RoutingTarget {
            dns_name: spec.require_str("dns_name")?.trim_end_matches('.').to_string(),
            hosted_zone_id: spec.require_str("hosted_zone_id")?.to_string(),
        };
        let register_command = spec.config_str("register_command").map(str::to_string);
        Ok(Self {
            spec,
            target,
            register_command,
        })
    }
}

#[async_trait]
impl Service for EndpointService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    async fn install(&self, session: &RemoteSession) -> Result<Option<InstallValues>> {
        prepare_directories(session, &self.spec).await?;
        if let Some(command) = &self.register_command {
            session.check_as_root(command.as_str(), &[]).await?;
        }
        let mut values = InstallValues::new();
        values.insert("dns_name".into(), Value::from(self.target.dns_name.clone()));
        Ok(Some(values))
    }

    async fn uninstall(&self) -> Result<()> {
        tracing::info!(
            service = %self.spec.name,
            endpoint = %self.target.dns_name,
            "released endpoint"
        );
        Ok(())
    }

    fn domain_routing(&self) -> Option<&dyn DomainRouting> {
        Some(self)
    }
}

#[async_trait]
impl DomainRouting for EndpointService {
    async fn routing_target(&self) -> Result<RoutingTarget> {
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use crate::fakes;
    use crate::models::ServiceManifest;

    fn endpoint(yaml: &str) -> Result<EndpointService> {
        let manifest: ServiceManifest = serde_yaml::from_str(yaml).unwrap();
        let context = fakes::build_context("master", false);
        EndpointService::new(ServiceSpec::new("lb", manifest, context)?)
    }

    #[tokio::test]
    async fn exposes_routing_target() {
        let yaml = "type: endpoint\ndns_name: lb-1.elb.amazonaws.com.\nhosted_zone_id: ZELB\n";
        let service = endpoint(yaml).unwrap();
        let routing = service.domain_routing().unwrap();
        let target = routing.routing_target().await.unwrap();
        assert_eq!(target.dns_name, "lb-1.elb.amazonaws.com");
        assert_eq!(target.hosted_zone_id, "ZELB");
    }

    #[test]
    fn hosted_zone_is_required() {
        assert!(matches!(
            endpoint("type: endpoint\ndns_name: lb-1.elb.amazonaws.com\n"),
            Err(OrchestratorError::InvalidManifest(_))
        ));
    }
}
