use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use authguard::config::Config;
use authguard::start_server_with_config;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound on draining connections and the audit queue
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "authguard-server", version, about = "Request authentication guard server")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_tracing(production: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if production {
        builder.json().with_current_span(false).init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(config.environment.is_production());

    if let Err(e) = config.validate() {
        if config.environment.is_production() {
            error!(error = %e, "Configuration invalid; refusing to start in production");
            return Err(e.into());
        }
        warn!(error = %e, "Configuration incomplete; continuing in development");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server = start_server_with_config(config, shutdown_rx).await?;
    info!(port = server.port, "Server started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping server...");
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server.stopped())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out; pending audit events may be lost"
        );
    }
    Ok(())
}
