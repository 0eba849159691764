use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ChangeSet, RecordSet};

/// Hosted-zone API used by the domain reconciler.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// The zone's apex name, without the trailing dot.
    async fn zone_apex(&self, zone_id: &str) -> Result<String>;

    /// Record sets of `record_type` starting at `name`, in provider order.
    async fn list_record_sets(
        &self,
        zone_id: &str,
        record_type: &str,
        name: &str,
    ) -> Result<Vec<RecordSet>>;

    async fn commit(&self, changes: &ChangeSet) -> Result<()>;
}
