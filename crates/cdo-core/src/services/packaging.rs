use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::error::{OrchestratorError, Result};
use crate::models::PackagingConfig;

use super::build_log::BuildLog;
use super::process;

const MAX_ATTEMPTS: u32 = 3;

/// A built distributable, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub package_name: String,
    pub filename: String,
    pub path: PathBuf,
}

/// What to package and where its output goes.
pub struct PackageRequest<'a> {
    pub source_dir: &'a Path,
    pub app: &'a str,
    pub label: &'a str,
    pub short_ref: &'a str,
    pub committed_at: DateTime<Utc>,
    pub log: &'a BuildLog,
}

impl PackageRequest<'_> {
    /// `<app>.<label>.<committed %Y%m%d%H%M%S>.<short ref>`
    pub fn package_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.app,
            self.label,
            self.committed_at.format("%Y%m%d%H%M%S"),
            self.short_ref
        )
    }
}

#[async_trait]
pub trait ArtifactPackager: Send + Sync {
    async fn build_artifact(&self, request: &PackageRequest<'_>) -> Result<Artifact>;
}

/// Runs the configured packaging command in the source tree and caches
/// its output per package name.
pub struct CommandPackager {
    config: PackagingConfig,
    cache_dir: PathBuf,
}

impl CommandPackager {
    pub fn new(config: PackagingConfig, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            cache_dir: cache_dir.into(),
        }
    }

    /// Index env vars for retry `attempt` (0 = first try): mirror `attempt`
    /// as the index, the rest as extra indexes.
    pub fn mirror_env(&self, attempt: u32) -> Vec<(String, String)> {
        let mirrors = &self.config.mirrors;
        if mirrors.is_empty() {
            return Vec::new();
        }
        let primary = attempt as usize % mirrors.len();
        let extras: Vec<&str> = mirrors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary)
            .map(|(_, m)| m.as_str())
            .collect();
        let mut env = vec![(self.config.index_env.clone(), mirrors[primary].clone())];
        if !extras.is_empty() {
            env.push((self.config.extra_index_env.clone(), extras.join(" ")));
        }
        env
    }

    async fn cached(&self, package_name: &str) -> Result<Option<Artifact>> {
        let dir = self.cache_dir.join(package_name);
        if !dir.is_dir() {
            return Ok(None);
        }
        Ok(first_file(&dir).await?.map(|path| artifact(package_name, path)))
    }

    async fn run_once(
        &self,
        request: &PackageRequest<'_>,
        attempt: u32,
        output: &Path,
    ) -> Result<process::Captured> {
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(OrchestratorError::Packaging("packaging command is empty".into()));
        };
        let output_str = output.to_string_lossy();
        let args: Vec<String> = args.iter().map(|a| a.replace("{output}", &output_str)).collect();
        let mut cmd = Command::new(program);
        cmd.args(&args).current_dir(request.source_dir);
        for (key, value) in self.mirror_env(attempt) {
            cmd.env(key, value);
        }
        let described = process::describe(program, &args);
        request
            .log
            .info(format!("packaging (attempt {}): {described}", attempt + 1));
        process::run_logged(cmd, request.log, "package")
            .await
            .map_err(|e| OrchestratorError::Packaging(format!("failed to run {program}: {e}")))
    }
}

fn artifact(package_name: &str, path: PathBuf) -> Artifact {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    Artifact {
        package_name: package_name.to_string(),
        filename,
        path,
    }
}

async fn first_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}

#[async_trait]
impl ArtifactPackager for CommandPackager {
    async fn build_artifact(&self, request: &PackageRequest<'_>) -> Result<Artifact> {
        let package_name = request.package_name();
        if let Some(cached) = self.cached(&package_name).await? {
            request.log.info(format!("using cached package {}", cached.filename));
            return Ok(cached);
        }

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = Duration::from_secs(u64::from(attempt * attempt));
                let seconds = delay.as_secs();
                request
                    .log
                    .warn(format!("packaging failed, retrying in {seconds}s: {last_error}"));
                tokio::time::sleep(delay).await;
            }
            let output = tempfile::Builder::new().prefix("cdo-dist-").tempdir()?;
            let captured = self.run_once(request, attempt, output.path()).await?;
            if !captured.success() {
                last_error = format!("exit {}: {}", captured.status, tail(&captured.stderr));
                continue;
            }
            let Some(produced) = first_file(output.path()).await? else {
                last_error = "command produced no file".to_string();
                continue;
            };

            let cache = self.cache_dir.join(&package_name);
            tokio::fs::create_dir_all(&cache).await?;
            let built = artifact(&package_name, produced);
            let cached_path = cache.join(&built.filename);
            tokio::fs::copy(&built.path, &cached_path).await?;
            request.log.info(format!("built package {}", built.filename));
            return Ok(artifact(&package_name, cached_path));
        }
        Err(OrchestratorError::Packaging(format!(
            "{package_name}: gave up after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

fn tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(script: &str, mirrors: &[&str]) -> PackagingConfig {
        PackagingConfig {
            command: vec!["sh".into(), "-c".into(), script.into()],
            mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
            ..PackagingConfig::default()
        }
    }

    fn request<'a>(source: &'a Path, log: &'a BuildLog) -> PackageRequest<'a> {
        PackageRequest {
            source_dir: source,
            app: "shop",
            label: "branch-foo",
            short_ref: "abcdef0",
            committed_at: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
            log,
        }
    }

    #[test]
    fn package_name_includes_commit_time() {
        let log = BuildLog::disabled("t");
        let dir = PathBuf::from("/src");
        assert_eq!(
            request(&dir, &log).package_name(),
            "shop.branch-foo.20240506070809.abcdef0"
        );
    }

    #[test]
    fn mirrors_rotate_per_attempt() {
        let packager = CommandPackager::new(config("true", &["m1", "m2", "m3"]), "/cache");
        assert_eq!(
            packager.mirror_env(0),
            vec![
                ("PIP_INDEX_URL".to_string(), "m1".to_string()),
                ("PIP_EXTRA_INDEX_URL".to_string(), "m2 m3".to_string()),
            ]
        );
        assert_eq!(packager.mirror_env(1)[0].1, "m2");
        assert_eq!(packager.mirror_env(1)[1].1, "m1 m3");
        assert!(CommandPackager::new(config("true", &[]), "/cache").mirror_env(0).is_empty());
    }

    #[tokio::test]
    async fn builds_once_then_uses_cache() {
        let source = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let script = "echo run >> runs.txt; echo pkg > {output}/shop-1.0.tar.gz";
        let packager = CommandPackager::new(config(script, &[]), cache.path());
        let log = BuildLog::disabled("t");

        let first = packager.build_artifact(&request(source.path(), &log)).await.unwrap();
        assert_eq!(first.filename, "shop-1.0.tar.gz");
        assert!(first.path.starts_with(cache.path()));
        let second = packager.build_artifact(&request(source.path(), &log)).await.unwrap();
        assert_eq!(first, second);

        let runs = std::fs::read_to_string(source.path().join("runs.txt")).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_the_next_mirror() {
        let source = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let script = "echo $PIP_INDEX_URL >> tried.txt; \
                      test \"$PIP_INDEX_URL\" = m2 && touch {output}/shop.tar.gz";
        let packager = CommandPackager::new(config(script, &["m1", "m2"]), cache.path());
        let log = BuildLog::disabled("t");

        packager.build_artifact(&request(source.path(), &log)).await.unwrap();
        let tried = std::fs::read_to_string(source.path().join("tried.txt")).unwrap();
        assert_eq!(tried.lines().collect::<Vec<_>>(), vec!["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let source = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let packager = CommandPackager::new(config("echo broken >&2; exit 1", &[]), cache.path());
        let log = BuildLog::disabled("t");
        match packager.build_artifact(&request(source.path(), &log)).await {
            Err(OrchestratorError::Packaging(message)) => assert!(message.contains("broken")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
