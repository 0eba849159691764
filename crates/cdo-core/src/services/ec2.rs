use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{OrchestratorError, Result};
use crate::models::instance::{TAG_APP, TAG_BRANCH};
use crate::models::{InstanceConfig, InstanceDescription, InstanceFilter, InstanceState};

use super::aws::{args, AwsCli};
use super::compute::ComputeProvider;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunOutput {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    state: Ec2State,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    tags: Vec<Ec2Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Tag {
    key: String,
    value: String,
}

impl From<Ec2Instance> for InstanceDescription {
    fn from(instance: Ec2Instance) -> Self {
        InstanceDescription {
            id: instance.instance_id,
            public_dns_name: instance.public_dns_name.filter(|n| !n.is_empty()),
            state: InstanceState::parse(&instance.state.name),
            tags: instance.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

fn tag_list(tags: &BTreeMap<String, String>) -> serde_json::Value {
    tags.iter()
        .map(|(key, value)| json!({ "Key": key, "Value": value }))
        .collect()
}

fn parse_described(output: &str) -> Result<Vec<InstanceDescription>> {
    let described: DescribeOutput = serde_json::from_str(output)?;
    Ok(described
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(InstanceDescription::from)
        .collect())
}

/// [`ComputeProvider`] backed by EC2 through the `aws` client.
pub struct Ec2Compute {
    aws: AwsCli,
    launch: InstanceConfig,
}

impl Ec2Compute {
    pub fn new(aws: AwsCli, launch: InstanceConfig) -> Self {
        Self { aws, launch }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        self.aws.run(args).await.map_err(OrchestratorError::Provider)
    }
}

#[async_trait]
impl ComputeProvider for Ec2Compute {
    async fn create_instance(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceDescription> {
        let mut command = args([
            "ec2",
            "run-instances",
            "--image-id",
            &self.launch.image_id,
            "--instance-type",
            &self.launch.instance_type,
            "--count",
            "1",
        ]);
        if let Some(key_name) = &self.launch.key_name {
            command.extend(args(["--key-name", key_name]));
        }
        if !self.launch.security_groups.is_empty() {
            command.push("--security-group-ids".into());
            command.extend(self.launch.security_groups.iter().cloned());
        }
        if let Some(subnet_id) = &self.launch.subnet_id {
            command.extend(args(["--subnet-id", subnet_id]));
        }
        let specification = json!([{ "ResourceType": "instance", "Tags": tag_list(tags) }]);
        command.extend(args(["--tag-specifications", &specification.to_string()]));

        let output: RunOutput = serde_json::from_str(&self.run(&command).await?)?;
        output
            .instances
            .into_iter()
            .next()
            .map(InstanceDescription::from)
            .ok_or_else(|| OrchestratorError::Provider("run-instances returned no instance".into()))
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceDescription>> {
        let mut command = args(["ec2", "describe-instances", "--filters"]);
        if let Some(app) = &filter.app {
            command.push(format!("Name=tag:{TAG_APP},Values={app}"));
        }
        if let Some(label) = &filter.branch_label {
            command.push(format!("Name=tag:{TAG_BRANCH},Values={label}"));
        }
        command.push("Name=instance-state-name,Values=pending,running,stopping,stopped".into());
        let described = parse_described(&self.run(&command).await?)?;
        Ok(described.into_iter().filter(|i| filter.matches(i)).collect())
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription> {
        let command = args(["ec2", "describe-instances", "--instance-ids", instance_id]);
        parse_described(&self.run(&command).await?)?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::Provider(format!("instance {instance_id} not found")))
    }

    async fn tag(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let command = args([
            "ec2",
            "create-tags",
            "--resources",
            instance_id,
            "--tags",
            &tag_list(tags).to_string(),
        ]);
        self.run(&command).await?;
        Ok(())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let mut command = args(["ec2", "terminate-instances", "--instance-ids"]);
        command.extend(instance_ids.iter().cloned());
        self.run(&command).await?;
        Ok(())
    }
}
