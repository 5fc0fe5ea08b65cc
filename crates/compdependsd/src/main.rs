//! compdependsd: keeps the computation dependency edge set current.
//!
//! # Usage
//!
//! ```text
//! compdependsd --app compdepends --office SWT -F
//! compdependsd -T --config /etc/compdepends.toml
//! ```

use clap::Parser;
use compdependsd::{Cli, Daemon, DaemonOptions};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,compdependsd=debug,compdepends=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let daemon = Daemon::new(config, DaemonOptions::from(&cli));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl-C");
                // Keep the sender alive so the loop is not shut down.
                std::future::pending::<()>().await;
            }
        }
    });

    let exit = daemon.run(shutdown_rx).await?;
    info!(?exit, "exiting");
    Ok(())
}
