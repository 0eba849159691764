use tokio::sync::mpsc;

/// Where a build log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Orchestrator,
    Stdout,
    Stderr,
    Packaging,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "build",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Packaging => "package",
        }
    }
}

/// A log line event with the build id, source, and the line text.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub build: String,
    pub source: LogSource,
    pub line: String,
}

/// Sink for the lines of one build. Cloned into every collaborator that
/// produces output for it. A sink without a channel drops everything.
#[derive(Debug, Clone)]
pub struct BuildLog {
    build: String,
    tx: Option<mpsc::UnboundedSender<LogLine>>,
}

impl BuildLog {
    pub fn new(build: impl Into<String>, tx: mpsc::UnboundedSender<LogLine>) -> Self {
        Self {
            build: build.into(),
            tx: Some(tx),
        }
    }

    pub fn disabled(build: impl Into<String>) -> Self {
        Self {
            build: build.into(),
            tx: None,
        }
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    pub fn emit(&self, source: LogSource, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LogLine {
                build: self.build.clone(),
                source,
                line: line.into(),
            });
        }
    }

    /// Log at info through `tracing` and into the build log.
    pub fn info(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::info!(build = %self.build, "{line}");
        self.emit(LogSource::Orchestrator, line);
    }

    pub fn warn(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::warn!(build = %self.build, "{line}");
        self.emit(LogSource::Orchestrator, line);
    }
}

/// Build id used for per-build log files: `<label>-<short ref>`, lowercased,
/// with anything outside `[a-z0-9-]` replaced by `-`.
pub fn build_id(label: &str, short_ref: &str) -> String {
    format!("{label}-{short_ref}")
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => c,
            _ => '-',
        })
        .collect()
}
