use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Create,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRecord {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AliasTarget {
    pub hosted_zone_id: String,
    #[serde(rename = "DNSName")]
    pub dns_name: String,
    #[serde(default)]
    pub evaluate_target_health: bool,
}

impl AliasTarget {
    pub fn new(hosted_zone_id: impl Into<String>, dns_name: impl Into<String>) -> Self {
        Self {
            hosted_zone_id: hosted_zone_id.into(),
            dns_name: dns_name.into(),
            evaluate_target_health: false,
        }
    }

    /// Same zone id and DNS name, ignoring case and the trailing dot.
    pub fn points_at(&self, other: &AliasTarget) -> bool {
        self.hosted_zone_id == other.hosted_zone_id
            && same_name(&self.dns_name, &other.dns_name)
    }
}

/// One record set, in the shape the DNS provider lists and accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordSet {
    pub name: String,
    #[serde(rename = "Type")]
    pub record_type: String,
    #[serde(rename = "TTL", default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_records: Vec<ResourceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_target: Option<AliasTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl RecordSet {
    pub fn alias(name: &str, record_type: &str, target: AliasTarget) -> Self {
        Self {
            name: name.to_string(),
            record_type: record_type.to_string(),
            ttl: None,
            resource_records: Vec::new(),
            alias_target: Some(target),
            set_identifier: None,
            weight: None,
            region: None,
        }
    }

    pub fn cname(name: &str, value: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            record_type: "CNAME".to_string(),
            ttl: Some(ttl),
            resource_records: vec![ResourceRecord {
                value: value.to_string(),
            }],
            alias_target: None,
            set_identifier: None,
            weight: None,
            region: None,
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        same_name(&self.name, name)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.resource_records.iter().map(|r| r.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    pub action: ChangeAction,
    pub resource_record_set: RecordSet,
}

/// Record mutations against one hosted zone, committed as a single batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeSet {
    #[serde(skip)]
    pub zone_id: String,
    pub comment: String,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(zone_id: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            comment: comment.into(),
            changes: Vec::new(),
        }
    }

    pub fn create(&mut self, record: RecordSet) {
        self.changes.push(Change {
            action: ChangeAction::Create,
            resource_record_set: record,
        });
    }

    pub fn delete(&mut self, record: RecordSet) {
        self.changes.push(Change {
            action: ChangeAction::Delete,
            resource_record_set: record,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// The change batch as submitted to the provider.
    pub fn render(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Compare DNS names ignoring case and a trailing root dot.
pub fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_uses_provider_field_names() {
        let mut changes = ChangeSet::new("Z1", "deploy branch-foo");
        changes.create(RecordSet::alias(
            "example.com",
            "A",
            AliasTarget::new("ZELB", "lb-1.elb.amazonaws.com"),
        ));
        let cname = RecordSet::cname("foo.example.com", "dualstack.lb-1.elb.amazonaws.com", 300);
        changes.create(cname);
        let json: serde_json::Value = serde_json::from_str(&changes.render().unwrap()).unwrap();
        assert_eq!(json["Comment"], "deploy branch-foo");
        assert!(json.get("ZoneId").is_none());
        let alias = &json["Changes"][0];
        assert_eq!(alias["Action"], "CREATE");
        assert_eq!(alias["ResourceRecordSet"]["AliasTarget"]["DNSName"], "lb-1.elb.amazonaws.com");
        assert!(alias["ResourceRecordSet"].get("TTL").is_none());
        let cname = &json["Changes"][1]["ResourceRecordSet"];
        assert_eq!(cname["TTL"], 300);
        assert_eq!(cname["ResourceRecords"][0]["Value"], "dualstack.lb-1.elb.amazonaws.com");
    }

    #[test]
    fn listed_record_sets_parse() {
        let listed = r#"{
            "Name": "example.com.",
            "Type": "A",
            "SetIdentifier": "blue",
            "Weight": 10,
            "AliasTarget": {
                "HostedZoneId": "ZELB",
                "DNSName": "LB-1.elb.amazonaws.com.",
                "EvaluateTargetHealth": false
            }
        }"#;
        let record: RecordSet = serde_json::from_str(listed).unwrap();
        assert!(record.has_name("example.com"));
        assert_eq!(record.weight, Some(10));
        let target = record.alias_target.unwrap();
        assert!(target.points_at(&AliasTarget::new("ZELB", "lb-1.elb.amazonaws.com")));
        assert!(!target.points_at(&AliasTarget::new("ZOTHER", "lb-1.elb.amazonaws.com")));
    }
}
