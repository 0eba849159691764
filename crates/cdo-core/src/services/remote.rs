use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{OrchestratorError, Result};
use crate::models::{InstanceDescription, InstanceState};

use super::build_log::{BuildLog, LogSource};
use super::compute::ComputeProvider;
use super::process::OutputLine;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// The host answered but nothing listens yet.
    Refused,
    /// A previous connection attempt is still being set up.
    InProgress,
    Other,
}

#[derive(Debug, Clone)]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub message: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ConnectErrorKind::Refused | ConnectErrorKind::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub login: String,
}

/// Opens authenticated connections to remote hosts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> std::result::Result<Arc<dyn Connection>, ConnectError>;
}

/// One authenticated connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a shell command line, sending each output line to `output`.
    /// Returns the exit status.
    async fn exec(&self, command: &str, output: &mpsc::UnboundedSender<OutputLine>) -> Result<i32>;

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>>;

    async fn close(&self) -> Result<()>;
}

/// Unprivileged file access over an open connection.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, contents: &[u8]) -> Result<()>;
    async fn put(&self, local: &Path, remote: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// A command given either as a ready shell line or as an argument vector
/// to be quoted and joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn render(&self) -> String {
        match self {
            Self::Shell(line) => line.clone(),
            Self::Argv(argv) => shell_words::join(argv),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        Self::Shell(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        Self::Shell(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

impl<const N: usize> From<[&str; N]> for CommandLine {
    fn from(argv: [&str; N]) -> Self {
        Self::Argv(argv.iter().map(|a| a.to_string()).collect())
    }
}

impl From<&[&str]> for CommandLine {
    fn from(argv: &[&str]) -> Self {
        Self::Argv(argv.iter().map(|a| a.to_string()).collect())
    }
}

/// `KEY='value' command`
pub fn with_env(command: &CommandLine, env: &[(&str, &str)]) -> String {
    let mut words: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{key}={}", shell_words::quote(value)))
        .collect();
    words.push(command.render());
    words.join(" ")
}

/// `sudo 'KEY=value' command`
pub fn as_root(command: &CommandLine, env: &[(&str, &str)]) -> String {
    let mut words = vec!["sudo".to_string()];
    words.extend(
        env.iter()
            .map(|(key, value)| shell_words::quote(&format!("{key}={value}")).into_owned()),
    );
    words.push(command.render());
    words.join(" ")
}

/// Staging path for privileged uploads: `/etc/app/x` becomes `/tmp/-etc-app-x`.
pub fn staging_path(path: &str) -> String {
    format!("/tmp/{}", path.replace('/', "-"))
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub target_state: InstanceState,
    pub wait_timeout: Duration,
    pub wait_tick: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            target_state: InstanceState::Running,
            wait_timeout: Duration::from_secs(90),
            wait_tick: Duration::from_secs(5),
            connect_attempts: 20,
            connect_backoff: Duration::from_secs(3),
        }
    }
}

#[derive(Default)]
struct SessionState {
    depth: usize,
    connection: Option<Arc<dyn Connection>>,
    transfer_depth: usize,
    transfer: Option<Arc<dyn FileTransfer>>,
}

/// Depth-counted access to one remote instance. The first [`RemoteSession::open`]
/// waits for the instance and connects; nested opens share the connection;
/// releasing the last guard closes it.
pub struct RemoteSession {
    instance_id: String,
    login: String,
    compute: Arc<dyn ComputeProvider>,
    transport: Arc<dyn Transport>,
    log: BuildLog,
    options: SessionOptions,
    state: Mutex<SessionState>,
    connecting: tokio::sync::Mutex<()>,
}

impl RemoteSession {
    pub fn new(
        instance_id: impl Into<String>,
        login: impl Into<String>,
        compute: Arc<dyn ComputeProvider>,
        transport: Arc<dyn Transport>,
        log: BuildLog,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            login: login.into(),
            compute,
            transport,
            log,
            options: SessionOptions::default(),
            state: Mutex::new(SessionState::default()),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn log(&self) -> &BuildLog {
        &self.log
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current connection depth, mostly for tests.
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    /// Poll the provider until the instance reaches `target`.
    pub async fn wait_state(&self, target: &InstanceState) -> Result<InstanceDescription> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let description = self.compute.describe(&self.instance_id).await?;
            if description.state == *target {
                return Ok(description);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.options.wait_timeout {
                return Err(OrchestratorError::WaitTimeout {
                    attempts,
                    seconds: elapsed.as_secs_f64(),
                });
            }
            tracing::debug!(
                instance = %self.instance_id,
                state = %description.state,
                "waiting for {target}"
            );
            tokio::time::sleep(self.options.wait_tick).await;
        }
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.transport.connect(target).await {
                Ok(connection) => return Ok(connection),
                Err(e) if e.is_transient() && attempts < self.options.connect_attempts => {
                    tracing::warn!(
                        host = %target.host,
                        attempt = attempts,
                        "connection not ready ({}), retrying",
                        e.message
                    );
                    tokio::time::sleep(self.options.connect_backoff).await;
                }
                Err(e) => {
                    return Err(OrchestratorError::Connect {
                        attempts,
                        message: e.message,
                    })
                }
            }
        }
    }

    /// Acquire the connection, opening it if this is the outermost guard.
    pub async fn open(&self) -> Result<SessionGuard<'_>> {
        let _connecting = self.connecting.lock().await;
        {
            let mut state = self.state();
            if let Some(connection) = state.connection.clone() {
                state.depth += 1;
                return Ok(SessionGuard::new(self, connection));
            }
        }

        let description = self.wait_state(&self.options.target_state).await?;
        let host = description.public_dns_name.filter(|h| !h.is_empty()).ok_or_else(|| {
            OrchestratorError::Transport(format!("{} has no public address", self.instance_id))
        })?;
        let target = ConnectTarget {
            host,
            login: self.login.clone(),
        };
        let connection = self.connect(&target).await?;
        tracing::info!(instance = %self.instance_id, host = %target.host, "connected");

        let mut state = self.state();
        state.depth = 1;
        state.connection = Some(connection.clone());
        Ok(SessionGuard::new(self, connection))
    }

    /// Acquire the file-transfer sub-session, nested in a connection guard.
    pub async fn open_file_transfer(&self) -> Result<FileTransferGuard<'_>> {
        let session = self.open().await?;
        let existing = {
            let mut state = self.state();
            let existing = state.transfer.clone();
            if existing.is_some() {
                state.transfer_depth += 1;
            }
            existing
        };
        let transfer = match existing {
            Some(transfer) => transfer,
            None => {
                let transfer = match session.connection.open_file_transfer().await {
                    Ok(transfer) => transfer,
                    Err(e) => {
                        session.release().await?;
                        return Err(e);
                    }
                };
                let mut state = self.state();
                state.transfer_depth += 1;
                state.transfer.get_or_insert_with(|| transfer.clone()).clone()
            }
        };
        Ok(FileTransferGuard {
            owner: self,
            session: Some(session),
            transfer,
            released: false,
        })
    }

    fn release_session(&self) -> Option<Arc<dyn Connection>> {
        let mut state = self.state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.connection.take()
        } else {
            None
        }
    }

    fn release_transfer(&self) -> Option<Arc<dyn FileTransfer>> {
        let mut state = self.state();
        state.transfer_depth = state.transfer_depth.saturating_sub(1);
        if state.transfer_depth == 0 {
            state.transfer.take()
        } else {
            None
        }
    }

    async fn run(&self, rendered: String) -> Result<i32> {
        let session = self.open().await?;
        self.log.info(format!("$ {rendered}"));

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let log = self.log.clone();
        let instance = self.instance_id.clone();
        let forward = tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                tracing::debug!(instance = %instance, "{}", out.line);
                log.emit(LogSource::from(out.stream), out.line);
            }
        });
        let status = session.connection.exec(&rendered, &tx).await;
        drop(tx);
        let _ = forward.await;
        session.release().await?;

        let status = status?;
        if status != 0 {
            self.log.warn(format!("exit status {status}: {rendered}"));
        }
        Ok(status)
    }

    /// Run `command` with `env` prefixed. A non-zero status is returned, not raised.
    pub async fn execute(
        &self,
        command: impl Into<CommandLine>,
        env: &[(&str, &str)],
    ) -> Result<i32> {
        self.run(with_env(&command.into(), env)).await
    }

    pub async fn execute_as_root(
        &self,
        command: impl Into<CommandLine>,
        env: &[(&str, &str)],
    ) -> Result<i32> {
        self.run(as_root(&command.into(), env)).await
    }

    /// [`RemoteSession::execute`] that fails on a non-zero status.
    pub async fn check(&self, command: impl Into<CommandLine>, env: &[(&str, &str)]) -> Result<()> {
        let rendered = with_env(&command.into(), env);
        ensure_success(rendered.clone(), self.run(rendered).await?)
    }

    pub async fn check_as_root(
        &self,
        command: impl Into<CommandLine>,
        env: &[(&str, &str)],
    ) -> Result<()> {
        let rendered = as_root(&command.into(), env);
        ensure_success(rendered.clone(), self.run(rendered).await?)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let transfer = self.open_file_transfer().await?;
        let contents = transfer.transfer.read(path).await;
        transfer.release().await?;
        contents
    }

    pub async fn write_file(&self, path: &str, contents: &[u8], sudo: bool) -> Result<()> {
        let transfer = self.open_file_transfer().await?;
        let result = if sudo {
            let staged = staging_path(path);
            match transfer.transfer.write(&staged, contents).await {
                Ok(()) => self.install_staged(&staged, path).await,
                Err(e) => Err(e),
            }
        } else {
            transfer.transfer.write(path, contents).await
        };
        transfer.release().await?;
        result
    }

    pub async fn remove_file(&self, path: &str, sudo: bool) -> Result<()> {
        if sudo {
            return self.check_as_root(["rm", "-f", path], &[]).await;
        }
        let transfer = self.open_file_transfer().await?;
        let result = transfer.transfer.remove(path).await;
        transfer.release().await?;
        result
    }

    pub async fn make_directory(&self, path: &str, sudo: bool) -> Result<()> {
        if sudo {
            return self.check_as_root(["mkdir", "-m0755", "-p", path], &[]).await;
        }
        let transfer = self.open_file_transfer().await?;
        let result = transfer.transfer.mkdir(path).await;
        transfer.release().await?;
        result
    }

    pub async fn put_file(&self, local: &Path, remote: &str, sudo: bool) -> Result<()> {
        let transfer = self.open_file_transfer().await?;
        let result = if sudo {
            let staged = staging_path(remote);
            match transfer.transfer.put(local, &staged).await {
                Ok(()) => self.install_staged(&staged, remote).await,
                Err(e) => Err(e),
            }
        } else {
            transfer.transfer.put(local, remote).await
        };
        transfer.release().await?;
        result
    }

    /// Upload `local` recursively, depth-first, creating `remote` first.
    pub async fn put_directory(&self, local: &Path, remote: &str, sudo: bool) -> Result<()> {
        let transfer = self.open_file_transfer().await?;
        let result = self.put_directory_inner(local, remote, sudo).await;
        transfer.release().await?;
        result
    }

    fn put_directory_inner<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a str,
        sudo: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.make_directory(remote, sudo).await?;
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(local).await?;
            while let Some(entry) = dir.next_entry().await? {
                entries.push(entry);
            }
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let name = entry.file_name().to_string_lossy().into_owned();
                let target = format!("{}/{}", remote.trim_end_matches('/'), name);
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    self.put_directory_inner(&path, &target, sudo).await?;
                } else {
                    self.put_file(&path, &target, sudo).await?;
                }
            }
            Ok(())
        })
    }

    async fn install_staged(&self, staged: &str, path: &str) -> Result<()> {
        self.check_as_root(["mv", staged, path], &[]).await?;
        self.check_as_root(["chown", "root:root", path], &[]).await
    }
}

fn ensure_success(command: String, status: i32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(OrchestratorError::RemoteCommand { command, status })
    }
}

/// Holds one level of a [`RemoteSession`] open. Prefer [`SessionGuard::release`];
/// dropping closes the connection in the background.
pub struct SessionGuard<'a> {
    session: &'a RemoteSession,
    connection: Arc<dyn Connection>,
    released: bool,
}

impl<'a> SessionGuard<'a> {
    fn new(session: &'a RemoteSession, connection: Arc<dyn Connection>) -> Self {
        Self {
            session,
            connection,
            released: false,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(connection) = self.session.release_session() {
            tracing::debug!(instance = %self.session.instance_id, "closing connection");
            connection.close().await?;
        }
        Ok(())
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(connection) = self.session.release_session() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = connection.close().await {
                        tracing::warn!("failed to close connection: {e}");
                    }
                });
            }
        }
    }
}

/// One level of the file-transfer sub-session, plus the connection level under it.
pub struct FileTransferGuard<'a> {
    owner: &'a RemoteSession,
    session: Option<SessionGuard<'a>>,
    transfer: Arc<dyn FileTransfer>,
    released: bool,
}

impl FileTransferGuard<'_> {
    pub fn transfer(&self) -> &Arc<dyn FileTransfer> {
        &self.transfer
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let closed = match self.owner.release_transfer() {
            Some(transfer) => transfer.close().await,
            None => Ok(()),
        };
        if let Some(session) = self.session.take() {
            session.release().await?;
        }
        closed
    }
}

impl Drop for FileTransferGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(transfer) = self.owner.release_transfer() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = transfer.close().await {
                        tracing::warn!("failed to close file transfer: {e}");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeTransport, MemoryCompute};

    fn session(compute: Arc<MemoryCompute>, transport: Arc<FakeTransport>) -> RemoteSession {
        RemoteSession::new("i-1", "ubuntu", compute, transport, BuildLog::disabled("test"))
    }

    fn running_compute() -> Arc<MemoryCompute> {
        let compute = Arc::new(MemoryCompute::new());
        compute.insert_running("i-1", "ec2-1.example.com");
        compute
    }

    #[test]
    fn env_prefix_quotes_values() {
        let command = CommandLine::from(["echo", "hello world"]);
        assert_eq!(with_env(&command, &[("A", "x y")]), "A='x y' echo 'hello world'");
        assert_eq!(
            as_root(&command, &[("B", "1 2")]),
            "sudo 'B=1 2' echo 'hello world'"
        );
    }

    #[test]
    fn staging_path_flattens_slashes() {
        assert_eq!(staging_path("/etc/shop/values.json"), "/tmp/-etc-shop-values.json");
    }

    #[tokio::test]
    async fn nested_opens_share_one_connection() {
        let transport = Arc::new(FakeTransport::new());
        let session = session(running_compute(), transport.clone());

        let outer = session.open().await.unwrap();
        let inner = session.open().await.unwrap();
        assert_eq!(session.depth(), 2);
        session.execute("true", &[]).await.unwrap();
        inner.release().await.unwrap();
        assert_eq!(transport.closes(), 0);
        outer.release().await.unwrap();

        assert_eq!(session.depth(), 0);
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.closes(), 1);
    }

    #[tokio::test]
    async fn execute_returns_non_zero_status() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_status("false", 1);
        let session = session(running_compute(), transport.clone());
        assert_eq!(session.execute("false", &[]).await.unwrap(), 1);
        assert!(matches!(
            session.check("false", &[]).await,
            Err(OrchestratorError::RemoteCommand { status: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_transient_errors() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_connects(&[ConnectErrorKind::Refused, ConnectErrorKind::InProgress]);
        let session = session(running_compute(), transport.clone());
        session.execute("true", &[]).await.unwrap();
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_at_the_attempt_ceiling() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_connects(&[ConnectErrorKind::Refused; 25]);
        let session = session(running_compute(), transport.clone());
        let err = session.open().await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Connect { attempts: 20, .. }));
        assert_eq!(transport.connect_attempts(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_does_not_retry_other_errors() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_connects(&[ConnectErrorKind::Other]);
        let session = session(running_compute(), transport.clone());
        assert!(matches!(
            session.open().await.err().unwrap(),
            OrchestratorError::Connect { attempts: 1, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_reports_polls_performed() {
        let compute = Arc::new(MemoryCompute::new());
        compute.insert_pending("i-1");
        let transport = Arc::new(FakeTransport::new());
        let session = session(compute.clone(), transport).with_options(SessionOptions {
            wait_timeout: Duration::from_secs(10),
            wait_tick: Duration::from_secs(5),
            ..SessionOptions::default()
        });
        match session.open().await.err().unwrap() {
            OrchestratorError::WaitTimeout { attempts, seconds } => {
                assert_eq!(attempts, 3);
                assert_eq!(attempts as usize, compute.describe_calls("i-1"));
                assert!((seconds - 10.0).abs() < 0.01);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn sudo_write_stages_then_moves() {
        let transport = Arc::new(FakeTransport::new());
        let session = session(running_compute(), transport.clone());
        session
            .write_file("/etc/shop/values.json", b"{}", true)
            .await
            .unwrap();
        assert_eq!(transport.file("/tmp/-etc-shop-values.json").unwrap(), b"{}");
        assert_eq!(
            transport.commands(),
            vec![
                "sudo mv /tmp/-etc-shop-values.json /etc/shop/values.json",
                "sudo chown root:root /etc/shop/values.json",
            ]
        );
        assert_eq!(transport.connects(), 1);
        assert_eq!(session.depth(), 0);
    }

    #[tokio::test]
    async fn put_directory_recurses() {
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("a.conf"), "a").unwrap();
        std::fs::create_dir(local.path().join("sub")).unwrap();
        std::fs::write(local.path().join("sub/b.conf"), "b").unwrap();

        let transport = Arc::new(FakeTransport::new());
        let session = session(running_compute(), transport.clone());
        session.put_directory(local.path(), "/srv/app", false).await.unwrap();

        assert_eq!(transport.directories(), vec!["/srv/app", "/srv/app/sub"]);
        assert_eq!(transport.file("/srv/app/a.conf").unwrap(), b"a");
        assert_eq!(transport.file("/srv/app/sub/b.conf").unwrap(), b"b");
        assert_eq!(transport.connects(), 1);
    }
}
