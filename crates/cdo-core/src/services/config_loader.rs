use std::path::Path;

use crate::error::{OrchestratorError, Result};
use crate::models::{is_valid_service_name, AppConfig};

/// Read and validate the application config at `path`. Relative paths in
/// it resolve against the config file's directory.
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Err(OrchestratorError::ConfigNotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    let mut config: AppConfig = serde_yaml::from_str(&contents)
        .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

    for (field, value) in [
        ("name", &config.name),
        ("repository", &config.repository),
        ("instance.image_id", &config.instance.image_id),
    ] {
        if value.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(format!("{field} field is required")));
        }
    }
    for service in config.domains.services.keys().chain(config.domains.live.keys()) {
        if !is_valid_service_name(service) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "domains: {service:?} is not a service name"
            )));
        }
    }

    let base = path.parent().unwrap_or(Path::new("."));
    if config.instance.private_key.is_relative() {
        config.instance.private_key = base.join(&config.instance.private_key);
    }
    if let Some(cache) = config.cache_dir.as_mut().filter(|c| c.is_relative()) {
        *cache = base.join(&*cache);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MINIMAL: &str = "name: shop\nrepository: https://git.example.com/shop.git\n\
        instance:\n  image_id: ami-123\n  private_key: keys/deploy.pem\n";

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
name: shop
repository: https://git.example.com/shop.git
region: eu-west-1
instance:
  image_id: ami-123
  instance_type: t3.large
  security_groups: [sg-1, sg-2]
  private_key: /etc/cdo/deploy.pem
domains:
  zone_id: Z1
  services:
    lb: "{label}.shop.example.com"
  live:
    lb: shop.example.com
packaging:
  mirrors:
    - https://pypi.example.com/simple
hooks:
  finish:
    - https://chat.example.com/hook
cache_dir: cache
"#;
        let path = dir.path().join("shop.yml");
        fs::write(&path, yaml).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.instance.instance_type, "t3.large");
        assert_eq!(config.instance.security_groups.len(), 2);
        assert_eq!(config.instance.private_key, Path::new("/etc/cdo/deploy.pem"));
        assert_eq!(config.domains.live["lb"], "shop.example.com");
        assert_eq!(config.hooks.finish.len(), 1);
        assert_eq!(config.cache_dir.unwrap(), dir.path().join("cache"));
    }

    #[test]
    fn parse_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.yml");
        fs::write(&path, MINIMAL).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.config_dir, "deploy");
        assert_eq!(config.instance.login, "ubuntu");
        assert_eq!(config.instance.private_key, dir.path().join("keys/deploy.pem"));
        assert!(config.domains.zone_id.is_none());
        assert_eq!(config.install.command, vec!["pip3", "install"]);
    }

    #[test]
    fn missing_config_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("shop.yml")),
            Err(OrchestratorError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.yml");
        fs::write(&path, MINIMAL.replace("name: shop", "name: ''")).unwrap();
        assert!(matches!(load(&path), Err(OrchestratorError::InvalidConfig(_))));
    }

    #[test]
    fn domain_keys_must_be_service_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.yml");
        let config = format!("{MINIMAL}domains:\n  services:\n    Web-1: x.example.com\n");
        fs::write(&path, config).unwrap();
        assert!(matches!(load(&path), Err(OrchestratorError::InvalidConfig(_))));
    }
}
