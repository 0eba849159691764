use std::sync::Arc;

use crate::error::Result;
use crate::models::changeset::same_name;
use crate::models::{ChangeSet, RecordSet};

use super::dns::DnsProvider;
use super::service::RoutingTarget;

const CNAME_TTL: u32 = 300;
const APEX_RECORD_TYPES: [&str; 2] = ["A", "AAAA"];

fn fqdn(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// Accumulates record changes for one hosted zone and commits them as one batch.
pub struct DomainReconciler {
    dns: Arc<dyn DnsProvider>,
    apex: String,
    changes: ChangeSet,
}

impl DomainReconciler {
    pub async fn new(
        dns: Arc<dyn DnsProvider>,
        zone_id: &str,
        comment: impl Into<String>,
    ) -> Result<Self> {
        let apex = dns.zone_apex(zone_id).await?;
        Ok(Self {
            dns,
            apex,
            changes: ChangeSet::new(zone_id, comment),
        })
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn is_apex(&self, name: &str) -> bool {
        same_name(name, &self.apex)
    }

    /// Every record of `record_type` at exactly `name`, weighted or regional
    /// variants included.
    async fn listed(&self, record_type: &str, name: &str) -> Result<Vec<RecordSet>> {
        let listed = self
            .dns
            .list_record_sets(&self.changes.zone_id, record_type, &fqdn(name))
            .await?;
        Ok(listed
            .into_iter()
            .filter(|r| r.record_type == record_type && r.has_name(name))
            .collect())
    }

    /// The existing record of `record_type` at exactly `name`, if any.
    async fn existing(&self, record_type: &str, name: &str) -> Result<Option<RecordSet>> {
        Ok(self.listed(record_type, name).await?.into_iter().next())
    }

    /// Point `name` at `target`: alias `A` + `AAAA` at the apex, a dual-stack
    /// `CNAME` elsewhere. Records already pointing there are left alone;
    /// anything else at that name is deleted first.
    pub async fn route_domain(&mut self, name: &str, target: &RoutingTarget) -> Result<()> {
        if self.is_apex(name) {
            for record_type in APEX_RECORD_TYPES {
                let desired = target.alias_for(record_type);
                match self.existing(record_type, name).await? {
                    Some(record)
                        if record
                            .alias_target
                            .as_ref()
                            .is_some_and(|alias| alias.points_at(&desired)) =>
                    {
                        tracing::debug!("{record_type} {name} already routed");
                        continue;
                    }
                    Some(record) => self.changes.delete(record),
                    None => {}
                }
                self.changes
                    .create(RecordSet::alias(&fqdn(name), record_type, desired));
            }
        } else {
            let desired = target.dualstack();
            match self.existing("CNAME", name).await? {
                Some(record) if is_only_value(&record, &desired) => {
                    tracing::debug!("CNAME {name} already routed");
                    return Ok(());
                }
                Some(record) => self.changes.delete(record),
                None => {}
            }
            self.changes
                .create(RecordSet::cname(&fqdn(name), &desired, CNAME_TTL));
        }
        Ok(())
    }

    /// Stage deletion of every record routing `name`: `A` + `AAAA` at the
    /// apex, `CNAME` elsewhere, whatever they point at.
    pub async fn remove_domain(&mut self, name: &str) -> Result<()> {
        let record_types: &[&str] = if self.is_apex(name) {
            &APEX_RECORD_TYPES
        } else {
            &["CNAME"]
        };
        for record_type in record_types {
            for record in self.listed(record_type, name).await? {
                self.changes.delete(record);
            }
        }
        Ok(())
    }

    /// Submit the batch if it holds any change. Returns whether anything was sent.
    pub async fn commit(self) -> Result<bool> {
        if self.changes.is_empty() {
            tracing::info!(zone = %self.changes.zone_id, "no DNS changes to commit");
            return Ok(false);
        }
        let rendered = self.changes.render()?;
        tracing::info!(zone = %self.changes.zone_id, "committing DNS changes:\n{rendered}");
        self.dns.commit(&self.changes).await?;
        Ok(true)
    }
}

fn is_only_value(record: &RecordSet, value: &str) -> bool {
    let values: Vec<&str> = record.values().collect();
    values.len() == 1 && same_name(values[0], value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryDns;
    use crate::models::{AliasTarget, ChangeAction};

    fn target() -> RoutingTarget {
        RoutingTarget {
            dns_name: "lb-1.elb.amazonaws.com".into(),
            hosted_zone_id: "ZELB".into(),
        }
    }

    fn dns() -> Arc<MemoryDns> {
        Arc::new(MemoryDns::new("Z1", "example.com"))
    }

    #[tokio::test]
    async fn second_route_is_a_no_op() {
        let dns = dns();
        for name in ["example.com", "foo.example.com"] {
            let mut reconciler = DomainReconciler::new(dns.clone(), "Z1", "first").await.unwrap();
            reconciler.route_domain(name, &target()).await.unwrap();
            assert!(reconciler.commit().await.unwrap());

            let mut again = DomainReconciler::new(dns.clone(), "Z1", "second").await.unwrap();
            again.route_domain(name, &target()).await.unwrap();
            assert!(again.changes().is_empty(), "{name} should already be routed");
            assert!(!again.commit().await.unwrap());
        }
        assert_eq!(dns.commits().len(), 2);
    }

    #[tokio::test]
    async fn apex_creates_alias_pair() {
        let mut reconciler = DomainReconciler::new(dns(), "Z1", "deploy").await.unwrap();
        reconciler.route_domain("example.com.", &target()).await.unwrap();
        let changes = &reconciler.changes().changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].resource_record_set.record_type, "A");
        assert_eq!(
            changes[1].resource_record_set.alias_target.as_ref().unwrap().dns_name,
            "ipv6.lb-1.elb.amazonaws.com"
        );
    }

    #[tokio::test]
    async fn stale_apex_alias_is_deleted_then_created() {
        let dns = dns();
        let old_target = AliasTarget::new("ZOLD", "old-lb.elb.amazonaws.com.");
        let mut stale = RecordSet::alias("example.com.", "A", old_target);
        stale.set_identifier = Some("blue".into());
        stale.weight = Some(10);
        stale.region = Some("us-east-1".into());
        dns.insert(stale.clone());
        dns.insert(RecordSet::alias(
            "example.com.",
            "AAAA",
            AliasTarget::new("ZELB", "ipv6.lb-1.elb.amazonaws.com."),
        ));

        let mut reconciler = DomainReconciler::new(dns.clone(), "Z1", "deploy").await.unwrap();
        reconciler.route_domain("example.com", &target()).await.unwrap();
        let changes = &reconciler.changes().changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].action, ChangeAction::Delete);
        assert_eq!(changes[0].resource_record_set, stale);
        assert_eq!(changes[1].action, ChangeAction::Create);
        assert_eq!(changes[1].resource_record_set.record_type, "A");
    }

    #[tokio::test]
    async fn stale_cname_is_replaced() {
        let dns = dns();
        dns.insert(RecordSet::cname("foo.example.com.", "dualstack.other.elb.amazonaws.com", 60));
        let mut reconciler = DomainReconciler::new(dns.clone(), "Z1", "deploy").await.unwrap();
        reconciler.route_domain("foo.example.com", &target()).await.unwrap();
        let actions: Vec<_> = reconciler.changes().changes.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![ChangeAction::Delete, ChangeAction::Create]);
        reconciler.commit().await.unwrap();
        let records = dns.records();
        assert_eq!(records.len(), 1);
        let values: Vec<_> = records[0].values().collect();
        assert_eq!(values, vec!["dualstack.lb-1.elb.amazonaws.com"]);
    }

    #[tokio::test]
    async fn remove_domain_only_deletes() {
        let dns = dns();
        let mut reconciler = DomainReconciler::new(dns.clone(), "Z1", "deploy").await.unwrap();
        reconciler.route_domain("foo.example.com", &target()).await.unwrap();
        reconciler.commit().await.unwrap();

        let mut cleanup = DomainReconciler::new(dns.clone(), "Z1", "cleanup").await.unwrap();
        cleanup.remove_domain("foo.example.com").await.unwrap();
        cleanup.remove_domain("bar.example.com").await.unwrap();
        let actions: Vec<_> = cleanup.changes().changes.iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![ChangeAction::Delete]);
        cleanup.commit().await.unwrap();
        assert!(dns.records().is_empty());
    }

    #[tokio::test]
    async fn remove_domain_clears_stale_records() {
        let dns = dns();
        dns.insert(RecordSet::cname("foo.example.com.", "dualstack.old.elb.amazonaws.com", 60));
        let mut cleanup = DomainReconciler::new(dns.clone(), "Z1", "cleanup").await.unwrap();
        cleanup.remove_domain("foo.example.com").await.unwrap();
        assert_eq!(cleanup.changes().changes.len(), 1);
        cleanup.commit().await.unwrap();
        assert!(dns.records().is_empty());
    }

    #[tokio::test]
    async fn remove_domain_at_apex_deletes_both_aliases() {
        let dns = dns();
        let mut reconciler = DomainReconciler::new(dns.clone(), "Z1", "deploy").await.unwrap();
        reconciler.route_domain("example.com", &target()).await.unwrap();
        reconciler.commit().await.unwrap();
        let stale = AliasTarget {
            hosted_zone_id: "ZOLD".into(),
            dns_name: "old.elb.amazonaws.com.".into(),
            evaluate_target_health: false,
        };
        dns.insert(RecordSet::alias("www.example.com.", "A", stale));
        assert_eq!(dns.records().len(), 3);

        let mut cleanup = DomainReconciler::new(dns.clone(), "Z1", "cleanup").await.unwrap();
        cleanup.remove_domain("example.com.").await.unwrap();
        let changes = &cleanup.changes().changes;
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.action == ChangeAction::Delete));
        let types: Vec<&str> = changes
            .iter()
            .map(|c| c.resource_record_set.record_type.as_str())
            .collect();
        assert_eq!(types, vec!["A", "AAAA"]);
        cleanup.commit().await.unwrap();

        let left = dns.records();
        assert_eq!(left.len(), 1);
        assert!(left[0].has_name("www.example.com"));
    }
}
