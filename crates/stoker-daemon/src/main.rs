//! stokerd - activation daemon binary.
//!
//! Recovers the registry from the state directory, then runs until a
//! termination signal or a fatal persistence failure. The first signal
//! starts a graceful shutdown (drain remote calls, terminate children,
//! final snapshot); a second signal during that window skips straight to
//! killing every child so none are orphaned.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stoker_daemon::config::StokerConfig;
use stoker_daemon::daemon::ActivationDaemon;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// stokerd - object activation daemon
#[derive(Parser, Debug)]
#[command(name = "stokerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the state directory from the configuration.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `stoker_daemon=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => StokerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => StokerConfig::default(),
    };
    if let Some(state_dir) = args.state_dir {
        config.daemon.state_dir = state_dir;
    }

    let daemon = ActivationDaemon::recover(config).context("recovering daemon state")?;
    info!("stokerd running");

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let mut fatal = daemon.fatal_watch();

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
        changed = fatal.changed() => {
            if changed.is_ok() {
                if let Some(reason) = fatal.borrow().clone() {
                    error!(%reason, "fatal persistence failure");
                }
            }
        }
    }

    tokio::select! {
        () = daemon.shutdown() => {}
        _ = sigterm.recv() => {
            info!("second signal, abandoning graceful shutdown");
            daemon.kill_all_now();
        }
        _ = sigint.recv() => {
            info!("second signal, abandoning graceful shutdown");
            daemon.kill_all_now();
        }
    }

    Ok(())
}
