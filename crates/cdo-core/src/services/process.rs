use std::ffi::OsStr;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::build_log::{BuildLog, LogSource};

/// Which pipe a line of child output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

impl From<Stream> for LogSource {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Stdout => LogSource::Stdout,
            Stream::Stderr => LogSource::Stderr,
        }
    }
}

/// Result of a finished child process.
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run `cmd` to completion, forwarding each stdout/stderr line to `sink`
/// as it arrives while also collecting both streams.
pub async fn run_streaming(
    mut cmd: Command,
    sink: Option<&mpsc::UnboundedSender<OutputLine>>,
) -> std::io::Result<Captured> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, Stream::Stderr, tx));
    } else {
        drop(tx);
    }

    let mut captured = Captured::default();
    // Channel closes once both reader tasks hit EOF.
    while let Some(out) = rx.recv().await {
        let buffer = match out.stream {
            Stream::Stdout => &mut captured.stdout,
            Stream::Stderr => &mut captured.stderr,
        };
        buffer.push_str(&out.line);
        buffer.push('\n');
        if let Some(sink) = sink {
            let _ = sink.send(out);
        }
    }

    let status = child.wait().await?;
    captured.status = status.code().unwrap_or(-1);
    Ok(captured)
}

/// Send every line of `pipe` until EOF. Bytes that are not UTF-8 are
/// replaced rather than ending the read, so the pipe is always drained.
async fn forward_lines<R>(pipe: R, stream: Stream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                let _ = tx.send(OutputLine { stream, line });
            }
            Err(e) => {
                tracing::warn!("failed to read child {stream:?}: {e}");
                break;
            }
        }
    }
}

/// Same as [`run_streaming`], with lines going to the build log and `tracing`.
pub async fn run_logged(cmd: Command, log: &BuildLog, label: &str) -> std::io::Result<Captured> {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let forward_log = log.clone();
    let label = label.to_string();
    let forward = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            tracing::debug!(build = %forward_log.build(), "[{label}] {}", out.line);
            forward_log.emit(LogSource::Packaging, out.line);
        }
    });
    let captured = run_streaming(cmd, Some(&tx)).await;
    drop(tx);
    let _ = forward.await;
    captured
}

/// Program name plus its arguments, for log and error messages.
pub fn describe<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut words = vec![program.to_string()];
    words.extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
    shell_words::join(words)
}
