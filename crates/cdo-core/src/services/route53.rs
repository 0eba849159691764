use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{OrchestratorError, Result};
use crate::models::{ChangeSet, RecordSet};

use super::aws::{args, AwsCli};
use super::dns::DnsProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZoneOutput {
    hosted_zone: HostedZone,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZone {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordSetsOutput {
    #[serde(default)]
    resource_record_sets: Vec<RecordSet>,
}

/// [`DnsProvider`] backed by Route 53 through the `aws` client.
pub struct Route53Dns {
    aws: AwsCli,
}

impl Route53Dns {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        self.aws.run(args).await.map_err(OrchestratorError::Dns)
    }
}

fn parse_zone_apex(output: &str) -> Result<String> {
    let zone: HostedZoneOutput = serde_json::from_str(output)?;
    Ok(zone.hosted_zone.name.trim_end_matches('.').to_string())
}

fn parse_record_sets(output: &str) -> Result<Vec<RecordSet>> {
    let listed: RecordSetsOutput = serde_json::from_str(output)?;
    Ok(listed.resource_record_sets)
}

#[async_trait]
impl DnsProvider for Route53Dns {
    async fn zone_apex(&self, zone_id: &str) -> Result<String> {
        parse_zone_apex(&self.run(&args(["route53", "get-hosted-zone", "--id", zone_id])).await?)
    }

    async fn list_record_sets(
        &self,
        zone_id: &str,
        record_type: &str,
        name: &str,
    ) -> Result<Vec<RecordSet>> {
        let command = args([
            "route53",
            "list-resource-record-sets",
            "--hosted-zone-id",
            zone_id,
            "--start-record-name",
            name,
            "--start-record-type",
            record_type,
            "--max-items",
            "10",
        ]);
        parse_record_sets(&self.run(&command).await?)
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        let batch = serde_json::to_string(changes)?;
        let command = args([
            "route53",
            "change-resource-record-sets",
            "--hosted-zone-id",
            &changes.zone_id,
            "--change-batch",
            &batch,
        ]);
        self.run(&command).await?;
        Ok(())
    }
}
