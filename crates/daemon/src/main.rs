//! tidesync daemon entry point.
//!
//! Loads configuration, sets up logging, initializes and starts the sync
//! coordinator, and handles shutdown. A second signal during shutdown forces
//! an emergency stop.

mod signals;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tidesync_core::config::SyncConfig;
use tidesync_core::git::RemoteSync;
use tidesync_core::sync_engine::SyncCoordinator;

const LOG_FILE_PREFIX: &str = "tidesync-daemon.log";

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// tidesync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "tidesync-daemon",
    version,
    about = "Keeps a local working copy in sync with a remote git branch"
)]
struct Args {
    /// Path to the TOML configuration file
    /// (default: <config dir>/tidesync/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Print a configuration template and exit.
    #[arg(long)]
    print_config: bool,
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("no configuration directory on this platform")?;
    Ok(dir.join("tidesync").join("config.toml"))
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Console logging, plus a daily-rolling file when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .with(file_layer)
        .init();
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", SyncConfig::default_template());
        return Ok(());
    }

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = SyncConfig::load_and_resolve(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level)
        .to_string();
    let _log_guard = init_tracing(&log_level, config.daemon.log_dir.as_deref())?;

    // Startup banner
    info!("========================================");
    info!("  tidesync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", config_path.display());
    info!("Repository    : {}", config.repository.url);
    info!("Branch        : {}", config.repository.branch);
    info!("Working copy  : {}", config.repository.local_path.display());
    info!("Poll interval : {}s", config.sync.interval_secs);
    info!("Auto pull/push: {}/{}", config.sync.auto_pull, config.sync.auto_push);
    info!("Conflicts     : {}", config.sync.conflict_strategy);
    info!("Log level     : {}", log_level);
    info!("========================================");

    let backend = Arc::new(RemoteSync::from_config(&config));
    let coordinator = Arc::new(SyncCoordinator::new(config, backend));

    // Cloning can take a while; keep it off the async workers.
    let init = coordinator.clone();
    tokio::task::spawn_blocking(move || init.initialize())
        .await?
        .context("failed to initialize sync engine")?;
    coordinator.start().context("failed to start sync engine")?;

    signals::wait_for_shutdown().await;
    info!("shutdown signal received, stopping...");

    let stopping = coordinator.clone();
    let stop = tokio::task::spawn_blocking(move || stopping.stop());
    tokio::select! {
        result = stop => match result {
            Ok(Ok(message)) => info!("{message}"),
            Ok(Err(e)) => warn!(error = %e, "stop reported an error"),
            Err(e) => warn!(error = %e, "stop task failed"),
        },
        _ = signals::wait_for_shutdown() => {
            warn!("second signal received, forcing shutdown");
            if let Err(e) = coordinator.emergency_stop() {
                warn!(error = %e, "emergency stop failed");
            }
        }
    }

    let stats = coordinator.stats();
    info!(
        pulls = stats.pulls,
        pushes = stats.pushes,
        conflicts = stats.conflicts,
        errors = stats.errors,
        "tidesync daemon stopped"
    );
    Ok(())
}
