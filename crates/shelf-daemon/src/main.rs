//! shelf: Headless daemon that mirrors MyAnimeList lists into a vault.
//!
//! Runs a sync pass on a fixed interval and watches the vault so notes the
//! user moves or edits between passes are still found.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shelf_daemon::{Args, Config, Daemon, MalClient, MalConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,shelf_core=debug,shelf_daemon=debug"
    } else {
        "info,shelf_core=info,shelf_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_args(args)?;
    info!("Starting shelf");
    info!("Vault path: {:?}", config.vault_path);
    info!("Lists: {}", config.categories.join(", "));

    let catalog = MalClient::new(MalConfig::new(
        config.access_token.clone(),
        config.categories.clone(),
    ))?;
    let once = config.once;
    let daemon = Daemon::new(config, Arc::new(catalog));

    if once {
        if let Some(report) = daemon.sync_once().await {
            info!("Done: {}", report);
        }
        return Ok(());
    }

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    Ok(())
}
