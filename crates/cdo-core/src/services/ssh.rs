use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{OrchestratorError, Result};

use super::process::{self, OutputLine};
use super::remote::{
    ConnectError, ConnectErrorKind, ConnectTarget, Connection, FileTransfer, Transport,
};

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
    "-o",
    "ConnectTimeout=10",
];

/// Sort an `ssh` failure into the retryable socket errors and everything else.
pub fn classify_connect_failure(stderr: &str) -> ConnectErrorKind {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("connection refused") {
        ConnectErrorKind::Refused
    } else if lowered.contains("operation now in progress")
        || lowered.contains("connection timed out during banner exchange")
        || lowered.contains("connection reset by peer")
    {
        ConnectErrorKind::InProgress
    } else {
        ConnectErrorKind::Other
    }
}

/// OpenSSH client transport. Each connection is a ControlMaster socket;
/// commands and copies are multiplexed over it.
pub struct SshTransport {
    private_key: PathBuf,
    control_dir: tempfile::TempDir,
    counter: AtomicU64,
}

impl SshTransport {
    pub fn new(private_key: impl Into<PathBuf>) -> Result<Self> {
        let control_dir = tempfile::Builder::new().prefix("cdo-ssh-").tempdir()?;
        Ok(Self {
            private_key: private_key.into(),
            control_dir,
            counter: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> std::result::Result<Arc<dyn Connection>, ConnectError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let control_path = self.control_dir.path().join(format!("{n}.sock"));
        let destination = format!("{}@{}", target.login, target.host);

        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTIONS)
            .arg("-i")
            .arg(&self.private_key)
            .arg("-M")
            .arg("-S")
            .arg(&control_path)
            .arg("-fN")
            .arg(&destination);
        let output = cmd.output().await.map_err(|e| {
            ConnectError::new(ConnectErrorKind::Other, format!("failed to run ssh: {e}"))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ConnectError::new(classify_connect_failure(&stderr), stderr));
        }
        Ok(Arc::new(SshConnection {
            destination,
            control_path,
        }))
    }
}

struct SshConnection {
    destination: String,
    control_path: PathBuf,
}

impl SshConnection {
    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTIONS).arg("-S").arg(&self.control_path);
        cmd
    }

    fn scp(&self) -> Command {
        let mut cmd = Command::new("scp");
        cmd.args(SSH_OPTIONS)
            .arg("-q")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()));
        cmd
    }

    fn remote(&self, path: &str) -> String {
        format!("{}:{}", self.destination, path)
    }

    async fn quiet(&self, command: &str) -> Result<()> {
        let mut cmd = self.ssh();
        cmd.arg(&self.destination).arg("--").arg(command);
        let captured = process::run_streaming(cmd, None).await?;
        if !captured.success() {
            return Err(OrchestratorError::RemoteCommand {
                command: command.to_string(),
                status: captured.status,
            });
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = self.scp();
        cmd.arg(from).arg(to);
        let captured = process::run_streaming(cmd, None).await?;
        if !captured.success() {
            return Err(OrchestratorError::Transport(format!(
                "scp {from} {to} failed (exit {}): {}",
                captured.status,
                captured.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, command: &str, output: &mpsc::UnboundedSender<OutputLine>) -> Result<i32> {
        let mut cmd = self.ssh();
        cmd.arg(&self.destination).arg("--").arg(command);
        let captured = process::run_streaming(cmd, Some(output)).await?;
        Ok(captured.status)
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        Ok(Arc::new(ScpTransfer {
            connection: SshConnection {
                destination: self.destination.clone(),
                control_path: self.control_path.clone(),
            },
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut cmd = self.ssh();
        cmd.args(["-O", "exit"]).arg(&self.destination);
        let captured = process::run_streaming(cmd, None).await?;
        if !captured.success() {
            tracing::debug!("ssh -O exit: {}", captured.stderr.trim());
        }
        Ok(())
    }
}

/// `scp` over the master connection. Directory and removal calls go
/// through plain commands since scp has no verbs for them.
struct ScpTransfer {
    connection: SshConnection,
}

#[async_trait]
impl FileTransfer for ScpTransfer {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let local = tempfile::NamedTempFile::new()?;
        let local_path = local.path().to_string_lossy().into_owned();
        self.connection.copy(&self.connection.remote(path), &local_path).await?;
        Ok(tokio::fs::read(local.path()).await?)
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        let local = tempfile::NamedTempFile::new()?;
        tokio::fs::write(local.path(), contents).await?;
        self.put(local.path(), path).await
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.connection
            .copy(&local.to_string_lossy(), &self.connection.remote(remote))
            .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.connection.quiet(&shell_words::join(["rm", "-f", path])).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.connection.quiet(&shell_words::join(["mkdir", "-p", path])).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
