//! Region RPC
//!
//! The rack asks a region controller for boot configurations and reports node events
//! back. [`RegionClient`] is one connection to one region process; [`ClientService`]
//! hands out connections.

use crate::error::RpcError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Arguments accepted by `GetBootConfig`. Nothing else from the request context is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetBootConfigRequest {
    /// Rack identity.
    pub system_id: String,
    /// Address the request arrived on.
    pub local_ip: String,
    /// Client address.
    pub remote_ip: String,
    /// Architecture, e.g. `amd64`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Subarchitecture, e.g. `generic`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subarch: Option<String>,
    /// Client MAC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// SMBIOS UUID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_uuid: Option<String>,
    /// Boot method that matched the path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bios_boot_method: Option<String>,
}

/// `GetBootConfig` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Architecture, e.g. `amd64`.
    pub arch: String,
    /// Subarchitecture, e.g. `generic`.
    pub subarch: String,
    /// Operating system, e.g. `ubuntu`.
    pub osystem: String,
    /// Release, e.g. `noble`.
    pub release: String,
    /// OS the kernel comes from.
    pub kernel_osystem: String,
    /// Release the kernel comes from.
    pub kernel_release: String,
    /// Kernel path, when not the default.
    pub kernel: Option<String>,
    /// Initrd path, when not the default.
    pub initrd: Option<String>,
    /// Root image path.
    pub xinstall_path: Option<String>,
    /// Device tree path.
    pub boot_dtb: Option<String>,
    /// Boot purpose.
    pub purpose: String,
    /// Node hostname.
    pub hostname: String,
    /// Node domain.
    pub domain: String,
    /// Preseed location.
    pub preseed_url: String,
    /// Host serving the root filesystem.
    pub fs_host: String,
    /// Remote syslog host.
    pub log_host: String,
    /// Remote syslog port.
    pub log_port: Option<u16>,
    /// Extra kernel command line options.
    pub extra_opts: String,
    /// Node the config is for, when known.
    pub system_id: Option<String>,
    /// Load kernel and initrd over HTTP.
    pub http_boot: Option<bool>,
    /// Options for ephemeral boots only.
    pub ephemeral_opts: Option<String>,
}

/// Events the rack reports against a node's IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventType {
    NodeTftpRequest,
    NodeHttpRequest,
}

impl NodeEventType {
    /// Event type name the region expects.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeEventType::NodeTftpRequest => "NODE_TFTP_REQUEST",
            NodeEventType::NodeHttpRequest => "NODE_HTTP_REQUEST",
        }
    }
}

impl fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a `MarkNodeFailed` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkNodeFailedRequest {
    /// Node to mark failed.
    pub system_id: String,
    /// Why the node failed.
    pub error_description: String,
}

/// Body of a `SendEventIPAddress` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEventIpAddressRequest {
    /// A [`NodeEventType`] name.
    pub type_name: String,
    /// Client address.
    pub ip_address: String,
    /// Human readable description.
    pub description: String,
}

/// One connection to a region controller process.
#[async_trait::async_trait]
pub trait RegionClient: Send + Sync {
    /// Identifies the region process behind this connection.
    fn ident(&self) -> &str;

    /// Identity of this rack as the region knows it.
    fn local_ident(&self) -> &str;

    async fn get_boot_config(&self, request: GetBootConfigRequest) -> Result<BootConfig, RpcError>;

    async fn mark_node_failed(&self, request: MarkNodeFailedRequest) -> Result<(), RpcError>;

    async fn send_event_ip_address(&self, request: SendEventIpAddressRequest) -> Result<(), RpcError>;
}

/// Source of region connections.
#[async_trait::async_trait]
pub trait ClientService: Send + Sync {
    /// Any live connection, waiting for one if none is up yet.
    async fn get_client_now(&self) -> Result<Arc<dyn RegionClient>, RpcError>;

    /// Every connection that is currently live.
    fn get_all_clients(&self) -> Vec<Arc<dyn RegionClient>>;
}

/// Region client speaking JSON over HTTP: `POST {base_url}/rpc/{command}`.
///
/// A region with nothing to say answers `GetBootConfig` with a non-success status whose body
/// names `BootConfigNoResponse`.
#[derive(Debug, Clone)]
pub struct HttpRegionClient {
    client: Client,
    base_url: String,
    system_id: String,
}

impl HttpRegionClient {
    /// # Arguments
    /// * `base_url` - Region URL (e.g., "http://10.0.0.2:5240/MAAS")
    /// * `system_id` - This rack's system id
    pub fn new(base_url: &str, system_id: &str) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            system_id: system_id.to_string(),
        })
    }

    /// Region URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<Req, Resp>(&self, command: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/rpc/{}", self.base_url, command);
        debug!("Calling {} on {}", command, self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if !status.is_success() {
            if body.contains("BootConfigNoResponse") {
                return Err(RpcError::NoResponse);
            }
            return Err(RpcError::Remote(format!("{command} failed: {status} - {body}")));
        }

        serde_json::from_str(&body).map_err(|e| {
            RpcError::Remote(format!(
                "error decoding {command} response: {e} - Response (first 500 chars): {}",
                body.chars().take(500).collect::<String>()
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[async_trait::async_trait]
impl RegionClient for HttpRegionClient {
    fn ident(&self) -> &str {
        &self.base_url
    }

    fn local_ident(&self) -> &str {
        &self.system_id
    }

    async fn get_boot_config(&self, request: GetBootConfigRequest) -> Result<BootConfig, RpcError> {
        self.call("GetBootConfig", &request).await
    }

    async fn mark_node_failed(&self, request: MarkNodeFailedRequest) -> Result<(), RpcError> {
        self.call::<_, Empty>("MarkNodeFailed", &request).await?;
        Ok(())
    }

    async fn send_event_ip_address(&self, request: SendEventIpAddressRequest) -> Result<(), RpcError> {
        self.call::<_, Empty>("SendEventIpAddress", &request).await?;
        Ok(())
    }
}

/// Round-robins over a fixed set of region connections.
///
/// The set can be swapped at runtime; connections dropped from it stop being live.
#[derive(Default)]
pub struct StaticClientService {
    clients: RwLock<Vec<Arc<dyn RegionClient>>>,
    next: AtomicUsize,
}

impl StaticClientService {
    /// Service over a fixed client list.
    pub fn new(clients: Vec<Arc<dyn RegionClient>>) -> Self {
        Self {
            clients: RwLock::new(clients),
            next: AtomicUsize::new(0),
        }
    }

    /// One [`HttpRegionClient`] per region URL.
    pub fn from_urls(urls: &[String], system_id: &str) -> Result<Self, RpcError> {
        let clients = urls
            .iter()
            .map(|url| {
                HttpRegionClient::new(url, system_id).map(|c| Arc::new(c) as Arc<dyn RegionClient>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(clients))
    }

    /// Replaces the connected regions.
    pub fn set_clients(&self, clients: Vec<Arc<dyn RegionClient>>) {
        match self.clients.write() {
            Ok(mut guard) => *guard = clients,
            Err(poisoned) => *poisoned.into_inner() = clients,
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn RegionClient>> {
        match self.clients.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl fmt::Debug for StaticClientService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idents: Vec<String> = self
            .snapshot()
            .iter()
            .map(|client| client.ident().to_string())
            .collect();
        f.debug_struct("StaticClientService")
            .field("clients", &idents)
            .finish()
    }
}

#[async_trait::async_trait]
impl ClientService for StaticClientService {
    async fn get_client_now(&self) -> Result<Arc<dyn RegionClient>, RpcError> {
        let clients = self.snapshot();
        if clients.is_empty() {
            return Err(RpcError::NoConnections);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % clients.len();
        Ok(Arc::clone(&clients[index]))
    }

    fn get_all_clients(&self) -> Vec<Arc<dyn RegionClient>> {
        self.snapshot()
    }
}
