//! Rack controller daemon
//!
//! Answers network-booting machines over TFTP on every host address and over HTTP,
//! asking the region for each machine's boot configuration.
//!
//! Configuration comes from `/etc/maas/rackd.conf` (or the file named by
//! `MAAS_RACKD_CONFIG`), overridden by `MAAS_TFTP_ROOT`, `MAAS_TFTP_PORT`,
//! `MAAS_REGION_URLS` and `MAAS_SYSTEM_ID`.

use anyhow::{Context, Result};
use pxe_server::{RackConfig, RackServer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting rackd");

    let config = RackConfig::load().context("loading rack configuration")?;
    info!("Configuration:");
    info!("  TFTP root: {}", config.tftp_root.display());
    info!("  TFTP port: {}", config.tftp_port);
    info!("  HTTP bind: {}", config.http_bind);
    info!("  Regions: {}", config.region_urls.join(", "));

    let server = RackServer::new(config).context("building rack boot server")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
        }
        info!("Shutdown requested");
        shutdown.cancel();
    });

    server.run(cancel).await?;
    Ok(())
}
