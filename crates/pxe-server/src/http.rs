//! HTTP boot bridge
//!
//! Serves the TFTP backend over HTTP for firmware that boots from a URL, and exposes the
//! transfer metrics for scraping.

use crate::backend::{RequestContext, TftpBackend};
use crate::boot::Protocol;
use crate::error::{BackendError, Result};
use crate::metrics::TftpMetrics;
use axum::Router;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

#[derive(Clone)]
struct BridgeState {
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
    local: SocketAddr,
}

/// HTTP front end for the TFTP backend.
///
/// Serves `/boot/<path>` and `/metrics`.
pub struct HttpBridge {
    listener: TcpListener,
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
}

impl HttpBridge {
    /// Binds `addr`; nothing is served until [`HttpBridge::run`].
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<TftpBackend>,
        metrics: Arc<TftpMetrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP boot bridge listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            backend,
            metrics,
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let state = BridgeState {
            backend: self.backend,
            metrics: self.metrics,
            local: self.listener.local_addr()?,
        };
        axum::serve(
            self.listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
        info!("HTTP boot bridge stopped");
        Ok(())
    }
}

impl std::fmt::Debug for HttpBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBridge")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/boot/{*path}", get(boot_handler))
        .route("/metrics", get(metrics_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn boot_handler(
    State(state): State<BridgeState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
) -> Response {
    let context = RequestContext::new(state.local, remote, Protocol::Http);
    let reader = match state.backend.get_reader(&path, context, false).await {
        Ok(reader) => reader,
        Err(BackendError::NotFound(name)) => {
            debug!("HTTP boot file not found: {}", name);
            return (StatusCode::NOT_FOUND, "File not found").into_response();
        }
        Err(BackendError::Backend(message)) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
        }
    };

    match reader.into_bytes().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to read {} for HTTP boot: {}", path, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<BridgeState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::TRANSFER_LATENCY;
    use crate::mock::{MockClientService, MockImageCache, MockRegionClient};
    use crate::rpc::{BootConfig, NodeEventType};
    use std::time::Duration;

    struct Running {
        base: String,
        region: MockRegionClient,
        cancel: CancellationToken,
        _root: tempfile::TempDir,
    }

    async fn start() -> Running {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("bootx64.efi"), b"efi-binary").unwrap();
        let region = MockRegionClient::new("region-1", "rack-1");
        let backend = Arc::new(TftpBackend::new(
            root.path(),
            Arc::new(MockClientService::new(vec![region.clone()])),
            Arc::new(MockImageCache::new()),
        ));
        let metrics = Arc::new(TftpMetrics::new().unwrap());
        metrics.observe_transfer("pxelinux.0", 0.1);

        let bridge = HttpBridge::bind("127.0.0.1:0".parse().unwrap(), backend, metrics)
            .await
            .unwrap();
        let base = format!("http://{}", bridge.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn(bridge.run(cancel.clone()));
        Running {
            base,
            region,
            cancel,
            _root: root,
        }
    }

    #[tokio::test]
    async fn test_static_file_over_http() {
        let running = start().await;
        let response = reqwest::get(format!("{}/boot/bootx64.efi", running.base))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(&response.bytes().await.unwrap()[..], b"efi-binary");

        let mut events = Vec::new();
        for _ in 0..50 {
            events = running.region.events();
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_name, NodeEventType::NodeHttpRequest.to_string());
        assert_eq!(events[0].ip_address, "127.0.0.1");
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let running = start().await;
        let response = reqwest::get(format!("{}/boot/nothing-here", running.base))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_rendered_config_over_http() {
        let running = start().await;
        running.region.set_boot_config(BootConfig {
            arch: "amd64".to_string(),
            subarch: "generic".to_string(),
            osystem: "ubuntu".to_string(),
            release: "noble".to_string(),
            kernel_osystem: "ubuntu".to_string(),
            kernel_release: "noble".to_string(),
            kernel: Some("ubuntu/amd64/ga-24.04/noble/stable/boot-kernel".to_string()),
            initrd: Some("ubuntu/amd64/ga-24.04/noble/stable/boot-initrd".to_string()),
            xinstall_path: Some("ubuntu/amd64/ga-24.04/noble/stable/squashfs".to_string()),
            purpose: "commissioning".to_string(),
            hostname: "node1".to_string(),
            domain: "maas".to_string(),
            preseed_url: "http://10.0.0.2:5248/MAAS/metadata/".to_string(),
            fs_host: "10.0.0.2".to_string(),
            log_host: "10.0.0.2".to_string(),
            ..BootConfig::default()
        });
        let response = reqwest::get(format!("{}/boot/grub/grub.cfg-default-amd64", running.base))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.contains("linux  /images/"));
        running.cancel.cancel();
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let running = start().await;
        let response = reqwest::get(format!("{}/metrics", running.base)).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let text = response.text().await.unwrap();
        assert!(text.contains(TRANSFER_LATENCY));
        running.cancel.cancel();
    }
}
