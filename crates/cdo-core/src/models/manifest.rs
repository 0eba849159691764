use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SERVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{1,50}$").unwrap());

pub fn is_valid_service_name(name: &str) -> bool {
    SERVICE_NAME_RE.is_match(name)
}

/// One `<name>.yml` service declaration. Keys other than the ones below
/// are collected into `config` and handed to the service plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceManifest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub service_type: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_packages: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_repositories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_language_packages: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_install: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_install: Vec<String>,
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}
