use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};
use crate::services::remote::RemoteSession;
use crate::services::service::{prepare_directories, InstallValues, Service, ServiceSpec};

/// Long-running process supervised by systemd, running as the app user.
///
/// ```yaml
/// enabled: true
/// type: daemon
/// command: gunicorn shop.wsgi -b 0.0.0.0:8000
/// environment:
///   SHOP_SETTINGS: /etc/shop/web/settings.py
/// ```
pub struct DaemonService {
    spec: ServiceSpec,
    command: String,
    environment: Vec<(String, String)>,
}

impl DaemonService {
    pub fn new(spec: ServiceSpec) -> Result<Self> {
        let command = spec.require_str("command")?.to_string();
        let environment = match spec.config.get("environment") {
            None => Vec::new(),
            Some(Value::Object(map)) => environment_pairs(map)?,
            Some(other) => {
                return Err(OrchestratorError::InvalidManifest(format!(
                    "environment must be a mapping, not {other}"
                )))
            }
        };
        Ok(Self {
            spec,
            command,
            environment,
        })
    }

    pub fn unit_name(&self) -> String {
        format!("{}-{}", self.spec.app_name(), self.spec.name)
    }

    pub fn unit_file(&self) -> String {
        let app = self.spec.app_name();
        let mut unit = format!(
            "[Unit]\nDescription={app} {name} service\nAfter=network.target\n\n\
             [Service]\nUser={app}\nGroup={app}\nWorkingDirectory=/var/lib/{app}/{name}\n",
            name = self.spec.name,
        );
        for (key, value) in &self.environment {
            unit.push_str(&format!("Environment=\"{key}={}\"\n", value.replace('"', "\\\"")));
        }
        unit.push_str(&format!(
            "ExecStart=/bin/sh -c {}\nRestart=always\n\n[Install]\nWantedBy=multi-user.target\n",
            shell_words::quote(&self.command)
        ));
        unit
    }
}

fn environment_pairs(map: &Map<String, Value>) -> Result<Vec<(String, String)>> {
    map.iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key.clone(), s.clone())),
            Value::Number(n) => Ok((key.clone(), n.to_string())),
            Value::Bool(b) => Ok((key.clone(), b.to_string())),
            other => Err(OrchestratorError::InvalidManifest(format!(
                "environment.{key} must be a scalar, not {other}"
            ))),
        })
        .collect()
}

#[async_trait]
impl Service for DaemonService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    async fn install(&self, session: &RemoteSession) -> Result<Option<InstallValues>> {
        prepare_directories(session, &self.spec).await?;
        let unit = self.unit_name();
        let path = format!("/etc/systemd/system/{unit}.service");
        session
            .write_file(&path, self.unit_file().as_bytes(), true)
            .await?;
        session.check_as_root(["systemctl", "daemon-reload"], &[]).await?;
        session
            .check_as_root(["systemctl", "enable", "--now", unit.as_str()], &[])
            .await?;

        let mut values = InstallValues::new();
        values.insert("unit".into(), Value::from(unit));
        Ok(Some(values))
    }
}
