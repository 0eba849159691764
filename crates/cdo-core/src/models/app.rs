use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::Branch;

/// Top-level application config, loaded from one YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    /// Clone URL of the application repository.
    pub repository: String,
    /// Directory inside the repository holding service manifests and
    /// the config files copied to `/etc/<app>`.
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub instance: InstanceConfig,
    #[serde(default)]
    pub domains: DomainFormats,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    #[serde(default)]
    pub install: InstallConfig,
    #[serde(default)]
    pub packaging: PackagingConfig,
    #[serde(default)]
    pub hooks: HookConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// Where git mirrors and built artifacts are cached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub image_id: String,
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default = "default_login")]
    pub login: String,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainFormats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
    /// Service name to domain template for ordinary builds.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    /// Service name to domain template for promoted builds.
    #[serde(default)]
    pub live: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_bootstrap_packages")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_helper: Option<String>,
    #[serde(default = "default_user_groups")]
    pub user_groups: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            packages: default_bootstrap_packages(),
            download_helper: None,
            user_groups: default_user_groups(),
        }
    }
}

/// How language-level packages and the built artifact get installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: default_install_command(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagingConfig {
    /// Run in the source tree; `{output}` is replaced with the output directory.
    #[serde(default = "default_packaging_command")]
    pub command: Vec<String>,
    #[serde(default = "default_index_env")]
    pub index_env: String,
    #[serde(default = "default_extra_index_env")]
    pub extra_index_env: String,
    /// Package index mirrors in priority order.
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            command: default_packaging_command(),
            index_env: default_index_env(),
            extra_index_env: default_extra_index_env(),
            mirrors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub finish: Vec<String>,
}

fn default_config_dir() -> String {
    "deploy".into()
}

fn default_instance_type() -> String {
    "t3.small".into()
}

fn default_login() -> String {
    "ubuntu".into()
}

fn default_bootstrap_packages() -> Vec<String> {
    ["build-essential", "python3-dev", "python3-pip"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_user_groups() -> String {
    "users,www-data".into()
}

fn default_install_command() -> Vec<String> {
    vec!["pip3".into(), "install".into()]
}

fn default_packaging_command() -> Vec<String> {
    ["python3", "-m", "build", "--sdist", "--outdir", "{output}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_index_env() -> String {
    "PIP_INDEX_URL".into()
}

fn default_extra_index_env() -> String {
    "PIP_EXTRA_INDEX_URL".into()
}

impl AppConfig {
    pub fn domain_templates(&self, live: bool) -> &BTreeMap<String, String> {
        if live {
            &self.domains.live
        } else {
            &self.domains.services
        }
    }

    /// Service name to fully interpolated domain for `branch`.
    pub fn resolved_domains(&self, branch: &Branch, live: bool) -> BTreeMap<String, String> {
        self.domain_templates(live)
            .iter()
            .map(|(service, template)| (service.clone(), self.interpolate(template, branch)))
            .collect()
    }

    pub fn interpolate(&self, template: &str, branch: &Branch) -> String {
        template
            .replace("{label}", &branch.label())
            .replace("{branch}", &branch.name())
            .replace("{app}", &self.name)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("cdo-{}", self.name)))
    }
}
