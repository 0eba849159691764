use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("config file not found at {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("invalid ref: {0}")]
    InvalidRef(String),

    #[error("invalid label: {0}")]
    InvalidLabel(String),

    #[error("connection failed after {attempts} attempt(s): {message}")]
    Connect { attempts: u32, message: String },

    #[error("failed to wait ({attempts} times, {seconds:.1} seconds)")]
    WaitTimeout { attempts: u32, seconds: f64 },

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("remote command exited with status {status}: {command}")]
    RemoteCommand { command: String, status: i32 },

    #[error("compute provider failed: {0}")]
    Provider(String),

    #[error("dns operation failed: {0}")]
    Dns(String),

    #[error("service cannot route domains: {0}")]
    NotRoutable(String),

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("packaging failed: {0}")]
    Packaging(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("service list was never published: {0}")]
    ServiceListUnavailable(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("nothing is deployed for {0}")]
    NotDeployed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    /// Prefix the message with `context` (a filename or service name),
    /// keeping the error kind.
    pub fn prefixed(self, context: &str) -> Self {
        use OrchestratorError::*;
        match self {
            InvalidConfig(m) => InvalidConfig(format!("{context}: {m}")),
            InvalidManifest(m) => InvalidManifest(format!("{context}: {m}")),
            InvalidName(m) => InvalidName(format!("{context}: {m}")),
            UnknownServiceType(m) => UnknownServiceType(format!("{context}: {m}")),
            UnknownDependency(m) => UnknownDependency(format!("{context}: {m}")),
            InvalidRef(m) => InvalidRef(format!("{context}: {m}")),
            InvalidLabel(m) => InvalidLabel(format!("{context}: {m}")),
            Transport(m) => Transport(format!("{context}: {m}")),
            Provider(m) => Provider(format!("{context}: {m}")),
            Dns(m) => Dns(format!("{context}: {m}")),
            NotRoutable(m) => NotRoutable(format!("{context}: {m}")),
            Git(m) => Git(format!("{context}: {m}")),
            Packaging(m) => Packaging(format!("{context}: {m}")),
            Notify(m) => Notify(format!("{context}: {m}")),
            Task(m) => Task(format!("{context}: {m}")),
            RemoteCommand { command, status } => RemoteCommand {
                command: format!("{context}: {command}"),
                status,
            },
            Yaml(e) => InvalidManifest(format!("{context}: {e}")),
            Io(e) => Io(std::io::Error::new(e.kind(), format!("{context}: {e}"))),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
