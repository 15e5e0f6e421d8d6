//! Rack boot server
//!
//! Wires the region connections, image cache, TFTP backend, listener fleet and HTTP bridge
//! together from a [`RackConfig`].

use crate::backend::TftpBackend;
use crate::cache::HttpImageCache;
use crate::config::RackConfig;
use crate::error::{PxeError, Result};
use crate::http::HttpBridge;
use crate::interfaces::{InterfaceSource, SystemInterfaces};
use crate::metrics::TftpMetrics;
use crate::rpc::StaticClientService;
use crate::service::TftpService;
use crate::tftp::TftpSettings;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The rack's boot services: TFTP fleet, HTTP bridge and their shared backend.
pub struct RackServer {
    config: RackConfig,
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
    fleet: TftpService,
}

impl RackServer {
    /// Builds the server against the host's real interfaces.
    pub fn new(config: RackConfig) -> Result<Self> {
        Self::with_interfaces(config, Arc::new(SystemInterfaces))
    }

    /// Like [`RackServer::new`] with addresses taken from `interfaces`.
    pub fn with_interfaces(config: RackConfig, interfaces: Arc<dyn InterfaceSource>) -> Result<Self> {
        if config.region_urls.is_empty() {
            warn!("No region URLs configured; boot config requests will fail");
        }
        let client_service = StaticClientService::from_urls(&config.region_urls, &config.system_id)?;
        let image_cache = HttpImageCache::new(&config.image_cache_url)?;
        let backend = Arc::new(TftpBackend::new(
            config.tftp_root.clone(),
            Arc::new(client_service),
            Arc::new(image_cache),
        ));
        let metrics = Arc::new(TftpMetrics::new()?);
        let settings = TftpSettings {
            max_block_size: config.tftp_max_blksize,
            timeout: config.tftp_timeout(),
        };
        let fleet = TftpService::new(
            config.tftp_port,
            Arc::clone(&backend),
            Arc::clone(&metrics),
            settings,
            interfaces,
            config.interface_refresh(),
        );
        Ok(Self {
            config,
            backend,
            metrics,
            fleet,
        })
    }

    /// Backend shared by the fleet and the bridge.
    pub fn backend(&self) -> &Arc<TftpBackend> {
        &self.backend
    }

    /// Metrics shared by the fleet and the bridge.
    pub fn metrics(&self) -> &Arc<TftpMetrics> {
        &self.metrics
    }

    /// The TFTP listener fleet.
    pub fn fleet(&self) -> &TftpService {
        &self.fleet
    }

    /// Runs the TFTP fleet and the HTTP bridge until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Starting rack boot server (root {}, TFTP port {})",
            self.config.tftp_root.display(),
            self.config.tftp_port
        );
        let bridge = HttpBridge::bind(
            self.config.http_bind,
            Arc::clone(&self.backend),
            Arc::clone(&self.metrics),
        )
        .await?;

        let http_cancel = cancel.child_token();
        let http = tokio::spawn(bridge.run(http_cancel.clone()));
        let fleet_result = self.fleet.run(cancel.child_token()).await;

        // The fleet only returns once cancelled; make sure the bridge follows.
        http_cancel.cancel();
        let http_result = http
            .await
            .map_err(|e| PxeError::Configuration(format!("HTTP bridge task failed: {e}")))?;
        fleet_result?;
        http_result?;
        info!("Rack boot server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for RackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RackServer")
            .field("config", &self.config)
            .field("fleet", &self.fleet)
            .finish()
    }
}
