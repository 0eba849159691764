use std::path::{Path, PathBuf};

use clap::Parser;
use tokio::sync::mpsc;

use cdo_core::services::config_loader;
use cdo_core::services::deployer::Deployer;
use cdo_core::services::dispatcher::Dispatcher;
use cdo_server::{build_log, router, AppState};

/// Deploy every pushed branch and pull request of an application onto its own instance.
#[derive(Parser)]
#[command(name = "cdo", version)]
struct Args {
    /// Application config (YAML).
    config: PathBuf,

    /// Interface the hook server binds to.
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port the hook server listens on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Extra path answering `pong`, for load balancer health checks.
    #[arg(long)]
    pong: Option<String>,

    /// Write diagnostics to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Directory for per-build logs (default: `<cache_dir>/logs`).
    #[arg(long)]
    build_log_dir: Option<PathBuf>,

    /// Concurrent deploy and cleanup jobs.
    #[arg(long)]
    jobs: Option<usize>,

    /// More output; repeat for trace.
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let default_level = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let _guard = setup_logging(args.log_file.as_deref(), default_level);

    let app = config_loader::load(&args.config)?;
    tracing::info!(app = %app.name, config = %args.config.display(), "loaded config");

    let log_dir = args.build_log_dir.unwrap_or_else(|| app.cache_dir().join("logs"));
    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let writer = build_log::start_writing(log_dir.clone(), log_rx);

    let deployer = Deployer::from_config(app, Some(log_tx))?;
    let dispatcher = args.jobs.map(Dispatcher::new).unwrap_or_default();
    tracing::info!(jobs = dispatcher.size(), "dispatcher ready");
    let mut state = AppState::new(deployer, dispatcher, log_dir);
    state.pong_path = args.pong;

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    writer.abort();
    Ok(())
}

/// Configure tracing to stderr, or to `log_file` when given.
/// Returns the guard that must be held alive for the duration of the program.
fn setup_logging(
    log_file: Option<&Path>,
    default_level: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
        return None;
    };

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let name = path.file_name().map_or_else(|| "cdo.log".into(), |n| n.to_os_string());
    let file_appender = tracing_appender::rolling::never(dir, name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
