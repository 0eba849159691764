use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{InstanceDescription, InstanceFilter};

/// Cloud instance API used for provisioning and bookkeeping.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch one instance with `tags` applied at creation.
    async fn create_instance(&self, tags: &BTreeMap<String, String>) -> Result<InstanceDescription>;

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceDescription>>;

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription>;

    async fn tag(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> Result<()>;

    async fn terminate(&self, instance_ids: &[String]) -> Result<()>;
}
