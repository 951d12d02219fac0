use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stockwatch::config::ConfigStore;
use stockwatch::monitor::MonitorEngine;

/// In-flight checks get this long to finish after a stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "stockwatch", version, about = "Availability monitor with multi-channel notifications")]
struct Cli {
    /// Path to the persisted configuration document.
    #[arg(long, default_value = "data/config.json")]
    config: PathBuf,
    /// Directory for rotated JSON log files.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn init_logging(log_dir: &Path) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "monitor.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_dir);

    let store = ConfigStore::open(&cli.config)?;
    info!(config = %store.path().display(), "configuration loaded");
    let engine = Arc::new(MonitorEngine::new(store));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loop_handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight checks");
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut loop_handle)
        .await
        .is_err()
    {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "monitor loop did not stop within the grace period, aborting"
        );
        loop_handle.abort();
    }
    Ok(())
}
