use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use cdo_core::services::build_log::LogLine;
use regex::Regex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

static BUILD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());

/// Path of the log file for `build`, or `None` if the id could escape `dir`.
pub fn log_path(dir: &Path, build: &str) -> Option<PathBuf> {
    BUILD_ID_RE
        .is_match(build)
        .then(|| dir.join(format!("{build}.log")))
}

/// Start a task that appends every received line to `<dir>/<build>.log`.
/// Files are opened per line, so no handle outlives its write.
/// The task ends once every sender is dropped.
pub fn start_writing(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<LogLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = append(&dir, &line).await {
                tracing::warn!(build = %line.build, "failed to write build log: {e}");
            }
        }
    })
}

async fn append(dir: &Path, line: &LogLine) -> std::io::Result<()> {
    let Some(path) = log_path(dir, &line.build) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bad build id {:?}", line.build),
        ));
    };
    tokio::fs::create_dir_all(dir).await?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
    let text = format!("{stamp} [{}] {}\n", line.source.as_str(), line.line);
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

/// Read the last `line_count` lines of a build log.
pub async fn read_tail(path: &Path, line_count: usize) -> std::io::Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(line_count);
    Ok(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdo_core::models::Branch;
    use cdo_core::services::build_log::{build_id, BuildLog, LogSource};

    #[test]
    fn build_ids_cannot_escape() {
        let dir = Path::new("/var/log/cdo");
        assert_eq!(
            log_path(dir, "branch-foo-abcdef0"),
            Some(PathBuf::from("/var/log/cdo/branch-foo-abcdef0.log"))
        );
        assert_eq!(log_path(dir, "../etc/passwd"), None);
        assert_eq!(log_path(dir, ""), None);
    }

    #[test]
    fn sanitized_build_ids_are_accepted() {
        let branch = Branch::named("shop", "feature/Login");
        let build = build_id(&branch.label(), "abcdef0");
        assert_eq!(
            log_path(Path::new("/var/log/cdo"), &build),
            Some(PathBuf::from("/var/log/cdo/branch-feature-login-abcdef0.log"))
        );
    }

    #[tokio::test]
    async fn no_handle_is_kept_between_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pull-7-abcdef0.log");
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = start_writing(dir.path().to_path_buf(), rx);

        let log = BuildLog::new("pull-7-abcdef0", tx);
        log.info("first");
        for _ in 0..500 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        std::fs::remove_file(&path).unwrap();

        log.info("second");
        drop(log);
        writer.await.unwrap();

        let text = read_tail(&path, 10).await.unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with("[build] second"));
    }

    #[tokio::test]
    async fn lines_are_appended_per_build() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = start_writing(dir.path().to_path_buf(), rx);

        let log = BuildLog::new("pull-7-abcdef0", tx.clone());
        log.info("deploying");
        log.emit(LogSource::Stderr, "warning: deprecated");
        BuildLog::new("branch-foo-1234567", tx).info("other build");
        drop(log);
        writer.await.unwrap();

        let text = read_tail(&dir.path().join("pull-7-abcdef0.log"), 10).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[build] deploying"));
        assert!(lines[1].ends_with("[stderr] warning: deprecated"));
        let last = read_tail(&dir.path().join("pull-7-abcdef0.log"), 1).await.unwrap();
        assert_eq!(last.lines().count(), 1);
        assert!(dir.path().join("branch-foo-1234567.log").exists());
    }
}
