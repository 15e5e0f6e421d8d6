//! TFTP listener
//!
//! One [`TftpServer`] listens on one address. Each read request gets its own task and its
//! own socket; the listening socket only ever sees new requests.

use crate::backend::{RequestContext, TftpBackend};
use crate::boot::Protocol;
use crate::error::{BackendError, Result};
use crate::metrics::TftpMetrics;
use crate::packet::{self, ErrorCode, MAX_PACKET_SIZE, ReadRequest, Request, TransferMode};
use crate::session::TransferSession;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings shared by every listener in the fleet.
#[derive(Debug, Clone)]
pub struct TftpSettings {
    /// Upper bound on any negotiated `blksize`.
    pub max_block_size: usize,
    /// Retransmission timeout unless negotiated.
    pub timeout: Duration,
}

impl Default for TftpSettings {
    fn default() -> Self {
        Self {
            max_block_size: 1008,
            timeout: Duration::from_secs(packet::DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// A TFTP listener on one address.
#[derive(Debug)]
pub struct TftpServer {
    socket: UdpSocket,
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
    settings: TftpSettings,
}

impl TftpServer {
    /// Binds the listening socket on `addr`.
    pub async fn bind(
        addr: SocketAddr,
        backend: Arc<TftpBackend>,
        metrics: Arc<TftpMetrics>,
        settings: TftpSettings,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("TFTP server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            backend,
            metrics,
            settings,
        })
    }

    /// Bound address; useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves requests until `cancel` fires. Transfers already running are left to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let local = self.socket.local_addr()?;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("TFTP receive error on {}: {}", local, e);
                        continue;
                    }
                },
            };

            match packet::parse_request(&buf[..n]) {
                Ok(Request::Read(request)) => {
                    let backend = Arc::clone(&self.backend);
                    let metrics = Arc::clone(&self.metrics);
                    let settings = self.settings.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_read(request, local, peer, backend, metrics, settings).await {
                            debug!("Transfer to {} ended: {}", peer, e);
                        }
                    });
                }
                Ok(Request::Write { filename }) => {
                    warn!("Refusing write of {} from {}", filename, peer);
                    send_error(local, peer, ErrorCode::AccessViolation, "Write access denied").await;
                }
                Err(e) => debug!("Ignoring packet from {}: {}", peer, e),
            }
        }
        info!("TFTP server on {} stopped", local);
        Ok(())
    }
}

async fn serve_read(
    request: ReadRequest,
    local: SocketAddr,
    peer: SocketAddr,
    backend: Arc<TftpBackend>,
    metrics: Arc<TftpMetrics>,
    settings: TftpSettings,
) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await?;
    socket.connect(peer).await?;

    if request.mode == TransferMode::Mail {
        send_on(&socket, ErrorCode::IllegalOperation, "MAIL mode not supported").await;
        return Ok(());
    }

    let context = RequestContext::new(local, peer, Protocol::Tftp);
    let reader = match backend.get_reader(&request.filename, context, false).await {
        Ok(reader) => reader,
        Err(BackendError::NotFound(_)) => {
            send_on(&socket, ErrorCode::FileNotFound, "File not found").await;
            return Ok(());
        }
        Err(BackendError::Backend(message)) => {
            send_on(&socket, ErrorCode::NotDefined, &message).await;
            return Ok(());
        }
    };

    let options = packet::negotiate(&request.options, settings.max_block_size, settings.timeout);
    let _timer = metrics.start_transfer(&request.filename);
    TransferSession::new(socket, options, reader).run().await?;
    Ok(())
}

async fn send_on(socket: &UdpSocket, code: ErrorCode, message: &str) {
    if let Err(e) = socket.send(&packet::error_packet(code, message)).await {
        debug!("Unable to send TFTP error: {}", e);
    }
}

async fn send_error(local: SocketAddr, peer: SocketAddr, code: ErrorCode, message: &str) {
    match UdpSocket::bind(SocketAddr::new(local.ip(), 0)).await {
        Ok(socket) => {
            if let Err(e) = socket.send_to(&packet::error_packet(code, message), peer).await {
                debug!("Unable to send TFTP error: {}", e);
            }
        }
        Err(e) => debug!("Unable to open error socket: {}", e),
    }
}
