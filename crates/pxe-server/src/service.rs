//! TFTP listener fleet
//!
//! Keeps one [`TftpServer`] per usable host address, re-checking the interfaces
//! periodically so hotplugged or renumbered interfaces are picked up without a restart.

use crate::backend::TftpBackend;
use crate::error::Result;
use crate::interfaces::{InterfaceSource, is_link_local};
use crate::metrics::TftpMetrics;
use crate::tftp::{TftpServer, TftpSettings};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How often interfaces are re-checked by default.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(45);

#[derive(Debug)]
struct RunningServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// One TFTP listener per host address, kept in step with the interfaces.
#[derive(Clone)]
pub struct TftpService {
    inner: Arc<Inner>,
}

struct Inner {
    port: u16,
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
    settings: TftpSettings,
    interfaces: Arc<dyn InterfaceSource>,
    refresh_interval: Duration,
    servers: Mutex<HashMap<IpAddr, RunningServer>>,
}

impl TftpService {
    /// Builds the fleet; nothing is bound until [`TftpService::update_servers`] or
    /// [`TftpService::run`].
    pub fn new(
        port: u16,
        backend: Arc<TftpBackend>,
        metrics: Arc<TftpMetrics>,
        settings: TftpSettings,
        interfaces: Arc<dyn InterfaceSource>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                port,
                backend,
                metrics,
                settings,
                interfaces,
                refresh_interval,
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts listeners for new addresses and stops those whose address went away.
    pub async fn update_servers(&self) -> Result<()> {
        // getifaddrs blocks.
        let interfaces = Arc::clone(&self.inner.interfaces);
        let desired: BTreeSet<IpAddr> = tokio::task::spawn_blocking(move || interfaces.addresses())
            .await
            .map_err(std::io::Error::from)??
            .into_iter()
            .filter(|ip| !is_link_local(ip))
            .collect();

        let mut servers = self.inner.servers.lock().await;
        let established: BTreeSet<IpAddr> = servers.keys().copied().collect();

        for ip in established.difference(&desired) {
            if let Some(server) = servers.remove(ip) {
                info!("Stopping TFTP server on {}", server.local_addr);
                server.cancel.cancel();
            }
        }

        for ip in desired.difference(&established) {
            let addr = SocketAddr::new(*ip, self.inner.port);
            match TftpServer::bind(
                addr,
                Arc::clone(&self.inner.backend),
                Arc::clone(&self.inner.metrics),
                self.inner.settings.clone(),
            )
            .await
            {
                Ok(server) => {
                    let local_addr = server.local_addr()?;
                    let cancel = CancellationToken::new();
                    let task = tokio::spawn(server.run(cancel.clone()));
                    servers.insert(
                        *ip,
                        RunningServer {
                            local_addr,
                            cancel,
                            task,
                        },
                    );
                }
                Err(e) => warn!("Unable to start TFTP server on {}: {}", addr, e),
            }
        }
        Ok(())
    }

    /// Addresses with a running listener.
    pub async fn addresses(&self) -> BTreeSet<IpAddr> {
        self.inner.servers.lock().await.keys().copied().collect()
    }

    /// Bound socket address of each running listener.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner
            .servers
            .lock()
            .await
            .values()
            .map(|server| server.local_addr)
            .collect()
    }

    /// Reconciles immediately and then every refresh interval until `cancel` fires, then stops
    /// every listener.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.inner.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.update_servers().await {
                        error!("Unable to update TFTP servers: {}", e);
                    }
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stops every listener and waits for each to finish.
    pub async fn stop(&self) {
        let servers: Vec<RunningServer> = self.inner.servers.lock().await.drain().map(|(_, s)| s).collect();
        for server in servers {
            server.cancel.cancel();
            match server.task.await {
                Ok(Err(e)) => warn!("TFTP server on {} failed: {}", server.local_addr, e),
                Err(e) => warn!("TFTP server task on {} panicked: {}", server.local_addr, e),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl std::fmt::Debug for TftpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpService")
            .field("port", &self.inner.port)
            .field("refresh_interval", &self.inner.refresh_interval)
            .finish()
    }
}
