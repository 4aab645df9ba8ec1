use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use trackd::config::Config;
use trackd::export::health::HealthMetrics;
use trackd::supervisor::Supervisor;

/// Tracking-session supervisor daemon for camera node clusters.
#[derive(Parser)]
#[command(name = "trackd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// Exit code reported on a startup failure.
const STARTUP_FAILURE: i32 = 2;

fn main() {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("trackd {}", version::full());
        return;
    }

    // Initialize tracing.
    let filter = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid log level {}: {e}", cli.log_level);
            std::process::exit(STARTUP_FAILURE);
        }
    };
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "could not load configuration");
            std::process::exit(STARTUP_FAILURE);
        }
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting trackd",
    );

    // Build and run the tokio runtime.
    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "could not build runtime");
            std::process::exit(STARTUP_FAILURE);
        }
    };

    if let Err(e) = rt.block_on(run(cfg)) {
        tracing::error!(error = format!("{e:#}"), "startup failed");
        std::process::exit(STARTUP_FAILURE);
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cfg = Arc::new(cfg);

    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Health metrics endpoint.
    let health = Arc::new(
        HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
    );
    health
        .start()
        .await
        .context("starting health metrics server")?;

    // Node supervision. Binary checks run up front so a broken node
    // fails its startup, not its first experiment.
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&cfg), Some(Arc::clone(&health))));
    supervisor
        .check_binaries()
        .await
        .context("verifying tracker and encoder binaries")?;

    tracing::info!(
        command_port = cfg.ports.command,
        frames_port = cfg.ports.frames,
        broadcast_port = cfg.ports.broadcast,
        "trackd ready",
    );

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown: stop a running experiment, then the endpoint.
    match supervisor.stop_experiment().await {
        Ok(()) => tracing::info!("running experiment stopped"),
        Err(trackd::supervisor::SupervisorError::NotRunning) => {}
        Err(e) => tracing::error!(error = %e, "error stopping experiment"),
    }
    health.stop().await?;

    tracing::info!("trackd stopped");

    Ok(())
}
