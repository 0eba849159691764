use async_trait::async_trait;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::services::remote::RemoteSession;
use crate::services::service::{prepare_directories, InstallValues, Service, ServiceSpec};

/// Connection keys copied from the manifest into the install result.
const CONNECTION_KEYS: &[&str] = &["host", "user", "port", "password"];

/// Manifest key to `createdb` long option.
const CREATEDB_OPTIONS: &[(&str, &str)] = &[
    ("host", "host"),
    ("port", "port"),
    ("user", "username"),
    ("encoding", "encoding"),
    ("lc_collate", "lc-collate"),
    ("lc_ctype", "lc-ctype"),
    ("tablespace", "tablespace"),
];

/// A per-branch database cloned from the master database.
pub struct PostgresService {
    spec: ServiceSpec,
}

impl PostgresService {
    pub fn new(spec: ServiceSpec) -> Result<Self> {
        for key in ["host", "user"] {
            spec.require_str(key)?;
        }
        Ok(Self { spec })
    }

    pub fn master_database(&self) -> String {
        self.spec
            .config_str("master_database")
            .map(str::to_string)
            .unwrap_or_else(|| "master".to_string())
    }

    /// `database_format` may use `{label}` (underscored) and `{app}`.
    pub fn database(&self) -> String {
        let label = self.spec.context.branch.label_underscored();
        match self.spec.config_str("database_format") {
            Some(format) => format
                .replace("{label}", &label)
                .replace("{app}", self.spec.app_name()),
            None => label,
        }
    }

    fn template(&self) -> String {
        let master = self.master_database();
        if self.database() == master {
            "template1".to_string()
        } else {
            master
        }
    }

    fn option(&self, key: &str) -> Option<String> {
        match self.spec.config.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn createdb(&self, template: &str) -> Vec<String> {
        let mut argv = vec!["createdb".to_string(), "--template".to_string(), template.to_string()];
        for (key, flag) in CREATEDB_OPTIONS {
            if let Some(value) = self.option(key) {
                argv.push(format!("--{flag}={value}"));
            }
        }
        argv.push(self.database());
        argv
    }

    fn connection_info(&self) -> InstallValues {
        let mut info = InstallValues::new();
        for key in CONNECTION_KEYS {
            if let Some(value) = self.spec.config.get(*key) {
                info.insert(key.to_string(), value.clone());
            }
        }
        info.insert("database".into(), Value::from(self.database()));
        info
    }
}

#[async_trait]
impl Service for PostgresService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    fn required_packages(&self) -> std::collections::BTreeSet<String> {
        let mut packages = self.spec.required_packages.clone();
        packages.insert("postgresql-client".into());
        packages
    }

    async fn install(&self, session: &RemoteSession) -> Result<Option<InstallValues>> {
        prepare_directories(session, &self.spec).await?;
        let password = self.option("password");
        let env: Vec<(&str, &str)> = password
            .as_deref()
            .map(|p| vec![("PGPASSWORD", p)])
            .unwrap_or_default();

        let template = self.template();
        let status = session.execute(self.createdb(&template), &env).await?;
        if status != 0 {
            // The template cannot be cloned while other sessions use it; dump
            // and restore it into a fresh database instead.
            session.log().warn(format!(
                "createdb from {template} failed with {status}, restoring from a dump"
            ));
            let host = self.option("host").unwrap_or_default();
            let user = self.option("user").unwrap_or_default();
            let dump = format!("/tmp/{template}.sql");
            let mut pg_dump = vec![
                "pg_dump".to_string(),
                "-h".into(),
                host.clone(),
                "-U".into(),
                user.clone(),
            ];
            if let Some(encoding) = self.option("encoding") {
                pg_dump.extend(["-E".to_string(), encoding]);
            }
            pg_dump.extend(["-f".to_string(), dump.clone(), template.clone()]);
            session.check(pg_dump, &env).await?;
            session.check(self.createdb("template1"), &env).await?;
            let psql = vec![
                "psql".to_string(),
                "-h".into(),
                host,
                "-U".into(),
                user,
                "-f".into(),
                dump,
                self.database(),
            ];
            session.check(psql, &env).await.map_err(|e| match e {
                OrchestratorError::RemoteCommand { command, status } => {
                    OrchestratorError::RemoteCommand {
                        command: format!("restore of {}: {command}", self.database()),
                        status,
                    }
                }
                other => other,
            })?;
        }
        Ok(Some(self.connection_info()))
    }
}
