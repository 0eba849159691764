//! In-memory providers for tests. Nothing here talks to a network or a cloud.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{OrchestratorError, Result};
use crate::models::{
    AppConfig, Branch, ChangeAction, ChangeSet, Commit, CommitMetadata, DomainFormats,
    InstanceConfig, InstanceDescription, InstanceFilter, InstanceState, RecordSet,
};
use crate::services::compute::ComputeProvider;
use crate::services::dns::DnsProvider;
use crate::services::packaging::{Artifact, ArtifactPackager, PackageRequest};
use crate::services::process::OutputLine;
use crate::services::remote::{
    ConnectError, ConnectErrorKind, ConnectTarget, Connection, FileTransfer, RemoteSession,
    Transport,
};
use crate::services::service::{BuildContext, InstallValues, Service, ServiceRegistry, ServiceSpec};
use crate::services::source::{SourceFetcher, SourceTree};

/// Commit every fake build context points at.
pub const FAKE_REF: &str = "0123456789abcdef0123456789abcdef01234567";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Config for an app named `shop` with one routed `lb` service.
pub fn app_config() -> AppConfig {
    AppConfig {
        name: "shop".into(),
        repository: "https://git.example.com/shop.git".into(),
        config_dir: "deploy".into(),
        region: None,
        instance: InstanceConfig {
            image_id: "ami-123".into(),
            instance_type: "t3.small".into(),
            key_name: None,
            security_groups: Vec::new(),
            subnet_id: None,
            login: "ubuntu".into(),
            private_key: PathBuf::from("/dev/null"),
        },
        domains: DomainFormats {
            zone_id: Some("Z1".into()),
            services: BTreeMap::from([("lb".to_string(), "{label}.shop.example.com".to_string())]),
            live: BTreeMap::from([("lb".to_string(), "example.com".to_string())]),
        },
        bootstrap: Default::default(),
        install: Default::default(),
        packaging: Default::default(),
        hooks: Default::default(),
        webhook_secret: Some("secret".into()),
        admin_token: Some("token".into()),
        cache_dir: None,
    }
}

pub fn build_context(branch_name: &str, live: bool) -> BuildContext {
    let commit = Commit::from_full_ref(FAKE_REF).expect("FAKE_REF is a full ref");
    BuildContext::new(Arc::new(app_config()), Branch::named("shop", branch_name), commit, live)
}

// --- compute ---

#[derive(Default)]
struct ComputeState {
    instances: BTreeMap<String, InstanceDescription>,
    describe_calls: HashMap<String, usize>,
    terminated: Vec<String>,
    fail_tagging: bool,
    next_id: usize,
}

/// Instances in a map. Created instances are running immediately.
#[derive(Default)]
pub struct MemoryCompute {
    state: Mutex<ComputeState>,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, description: InstanceDescription) {
        lock(&self.state)
            .instances
            .insert(description.id.clone(), description);
    }

    pub fn insert_running(&self, id: &str, dns_name: &str) {
        self.insert(InstanceDescription {
            id: id.into(),
            public_dns_name: Some(dns_name.into()),
            state: InstanceState::Running,
            tags: BTreeMap::new(),
        });
    }

    pub fn insert_pending(&self, id: &str) {
        self.insert(InstanceDescription {
            id: id.into(),
            public_dns_name: None,
            state: InstanceState::Pending,
            tags: BTreeMap::new(),
        });
    }

    pub fn description(&self, id: &str) -> Option<InstanceDescription> {
        lock(&self.state).instances.get(id).cloned()
    }

    pub fn describe_calls(&self, id: &str) -> usize {
        lock(&self.state).describe_calls.get(id).copied().unwrap_or(0)
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    pub fn fail_tagging(&self, fail: bool) {
        lock(&self.state).fail_tagging = fail;
    }
}

#[async_trait]
impl ComputeProvider for MemoryCompute {
    async fn create_instance(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Result<InstanceDescription> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let description = InstanceDescription {
            id: format!("i-{:04}", state.next_id),
            public_dns_name: Some(format!("ec2-{}.example.com", state.next_id)),
            state: InstanceState::Running,
            tags: tags.clone(),
        };
        state
            .instances
            .insert(description.id.clone(), description.clone());
        Ok(description)
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<InstanceDescription>> {
        Ok(lock(&self.state)
            .instances
            .values()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect())
    }

    async fn describe(&self, instance_id: &str) -> Result<InstanceDescription> {
        let mut state = lock(&self.state);
        *state.describe_calls.entry(instance_id.to_string()).or_default() += 1;
        state
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Provider(format!("no such instance {instance_id}")))
    }

    async fn tag(&self, instance_id: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_tagging {
            return Err(OrchestratorError::Provider("tagging is failing".into()));
        }
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| OrchestratorError::Provider(format!("no such instance {instance_id}")))?;
        instance.tags.extend(tags.clone());
        Ok(())
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        for id in instance_ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.state = InstanceState::Terminated;
            }
            state.terminated.push(id.clone());
        }
        Ok(())
    }
}

// --- dns ---

#[derive(Default)]
struct DnsState {
    records: Vec<RecordSet>,
    commits: Vec<ChangeSet>,
}

/// One hosted zone. Commits apply deletes and creates the way the provider
/// validates them: a delete must match an existing record exactly.
pub struct MemoryDns {
    zone_id: String,
    apex: String,
    state: Mutex<DnsState>,
}

impl MemoryDns {
    pub fn new(zone_id: &str, apex: &str) -> Self {
        Self {
            zone_id: zone_id.into(),
            apex: apex.into(),
            state: Mutex::new(DnsState::default()),
        }
    }

    pub fn insert(&self, record: RecordSet) {
        lock(&self.state).records.push(record);
    }

    pub fn records(&self) -> Vec<RecordSet> {
        lock(&self.state).records.clone()
    }

    pub fn commits(&self) -> Vec<ChangeSet> {
        lock(&self.state).commits.clone()
    }

    fn check_zone(&self, zone_id: &str) -> Result<()> {
        if zone_id == self.zone_id {
            Ok(())
        } else {
            Err(OrchestratorError::Dns(format!("no such hosted zone {zone_id}")))
        }
    }
}

#[async_trait]
impl DnsProvider for MemoryDns {
    async fn zone_apex(&self, zone_id: &str) -> Result<String> {
        self.check_zone(zone_id)?;
        Ok(self.apex.clone())
    }

    async fn list_record_sets(
        &self,
        zone_id: &str,
        record_type: &str,
        _name: &str,
    ) -> Result<Vec<RecordSet>> {
        self.check_zone(zone_id)?;
        Ok(lock(&self.state)
            .records
            .iter()
            .filter(|r| r.record_type == record_type)
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: &ChangeSet) -> Result<()> {
        self.check_zone(&changes.zone_id)?;
        let mut state = lock(&self.state);
        let mut records = state.records.clone();
        for change in &changes.changes {
            let record = &change.resource_record_set;
            match change.action {
                ChangeAction::Delete => {
                    let index = records.iter().position(|r| r == record).ok_or_else(|| {
                        let missing = format!("{} {}", record.record_type, record.name);
                        OrchestratorError::Dns(format!("{missing} does not exist"))
                    })?;
                    records.remove(index);
                }
                ChangeAction::Create => {
                    if records.iter().any(|r| {
                        r.record_type == record.record_type
                            && r.has_name(&record.name)
                            && r.set_identifier == record.set_identifier
                    }) {
                        return Err(OrchestratorError::Dns(format!(
                            "{} {} already exists",
                            record.record_type, record.name
                        )));
                    }
                    records.push(record.clone());
                }
            }
        }
        state.records = records;
        state.commits.push(changes.clone());
        Ok(())
    }
}

// --- transport ---

#[derive(Default)]
struct TransportState {
    connect_failures: VecDeque<ConnectErrorKind>,
    connect_attempts: usize,
    connects: usize,
    closes: usize,
    statuses: Vec<(String, i32)>,
    commands: Vec<String>,
    files: BTreeMap<String, Vec<u8>>,
    writes: Vec<(String, Vec<u8>)>,
    directories: Vec<String>,
}

impl TransportState {
    fn store(&mut self, path: &str, contents: Vec<u8>) {
        self.writes.push((path.to_string(), contents.clone()));
        self.files.insert(path.to_string(), contents);
    }
}

/// Records every command and keeps uploaded files in memory. Commands exit 0
/// unless a status was set for a substring of them.
#[derive(Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `fragment` exit with `status`.
    pub fn set_status(&self, fragment: &str, status: i32) {
        lock(&self.state).statuses.push((fragment.to_string(), status));
    }

    /// Fail the next connection attempts, one kind per attempt.
    pub fn fail_connects(&self, kinds: &[ConnectErrorKind]) {
        lock(&self.state).connect_failures.extend(kinds.iter().copied());
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        lock(&self.state).files.get(path).cloned()
    }

    /// Every version written to `path`, oldest first.
    pub fn writes(&self, path: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, contents)| contents.clone())
            .collect()
    }

    pub fn directories(&self) -> Vec<String> {
        lock(&self.state).directories.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> std::result::Result<Arc<dyn Connection>, ConnectError> {
        let mut state = lock(&self.state);
        state.connect_attempts += 1;
        if let Some(kind) = state.connect_failures.pop_front() {
            return Err(ConnectError::new(kind, format!("{}: connection failed", target.host)));
        }
        state.connects += 1;
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<Mutex<TransportState>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn exec(
        &self,
        command: &str,
        _output: &mpsc::UnboundedSender<OutputLine>,
    ) -> Result<i32> {
        let mut state = lock(&self.state);
        state.commands.push(command.to_string());
        Ok(state
            .statuses
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, status)| *status)
            .unwrap_or(0))
    }

    async fn open_file_transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).closes += 1;
        Ok(())
    }
}

#[async_trait]
impl FileTransfer for FakeConnection {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        lock(&self.state).files.get(path).cloned().ok_or_else(|| {
            OrchestratorError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{path}: no such file"),
            ))
        })
    }

    async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        lock(&self.state).store(path, contents.to_vec());
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<()> {
        let contents = tokio::fs::read(local).await?;
        lock(&self.state).store(remote, contents);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        lock(&self.state).files.remove(path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        lock(&self.state).directories.push(path.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// --- source and packaging ---

/// A fixed directory served as every checkout.
pub struct StaticSource {
    root: PathBuf,
    full_ref: Option<String>,
    fetches: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            full_ref: None,
            fetches: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    /// Abbreviations of `full_ref` resolve to it.
    pub fn with_ref(mut self, full_ref: &str) -> Self {
        self.full_ref = Some(full_ref.to_string());
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for StaticSource {
    async fn fetch(&self, _branch: &Branch, _reference: &str) -> Result<SourceTree> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(SourceTree::borrowed(&self.root))
    }

    async fn resolve_ref(&self, _branch: &Branch, reference: &str) -> Result<String> {
        self.full_ref
            .clone()
            .filter(|full| full.starts_with(&reference.to_ascii_lowercase()))
            .ok_or_else(|| OrchestratorError::Git(format!("unknown revision {reference}")))
    }

    async fn commit_metadata(&self, _branch: &Branch, _reference: &str) -> Result<CommitMetadata> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let at = Utc
            .with_ymd_and_hms(2024, 5, 6, 7, 8, 9)
            .single()
            .ok_or_else(|| OrchestratorError::Git("bad fixed timestamp".into()))?;
        Ok(CommitMetadata {
            authored_at: at,
            committed_at: at,
            message: "fixture commit".into(),
        })
    }
}

/// Writes a small file per request into `dir` instead of running a build.
pub struct StaticPackager {
    dir: PathBuf,
    built: Mutex<Vec<String>>,
}

impl StaticPackager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            built: Mutex::new(Vec::new()),
        }
    }

    /// Package names built so far.
    pub fn built(&self) -> Vec<String> {
        lock(&self.built).clone()
    }
}

#[async_trait]
impl ArtifactPackager for StaticPackager {
    async fn build_artifact(&self, request: &PackageRequest<'_>) -> Result<Artifact> {
        let package_name = request.package_name();
        let filename = format!("{package_name}.tar.gz");
        let path = self.dir.join(&filename);
        tokio::fs::write(&path, package_name.as_bytes()).await?;
        lock(&self.built).push(package_name.clone());
        Ok(Artifact {
            package_name,
            filename,
            path,
        })
    }
}

// --- services ---

/// A service whose install runs one marker command and returns its config.
pub struct RecordingService {
    spec: ServiceSpec,
}

#[async_trait]
impl Service for RecordingService {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    async fn install(&self, session: &RemoteSession) -> Result<Option<InstallValues>> {
        session
            .check(format!("echo install {}", self.spec.name), &[])
            .await?;
        let mut values = self.spec.config.clone();
        values.insert("installed".into(), Value::from(self.spec.name.clone()));
        Ok(Some(values))
    }
}

/// Built-in services plus `recorded`.
pub fn recording_registry() -> ServiceRegistry {
    let mut registry = ServiceRegistry::with_builtins();
    registry.register("recorded", |spec| Ok(Arc::new(RecordingService { spec })));
    registry
}
