//! Mock region RPC and image cache for unit testing
//!
//! These stand in for a region controller and the HTTP image cache so the backend can be
//! exercised without either running.

use crate::cache::{ImageCache, is_optional};
use crate::error::{PxeError, Result, RpcError};
use crate::reader::BootReader;
use crate::rpc::{
    BootConfig, ClientService, GetBootConfigRequest, MarkNodeFailedRequest, RegionClient,
    SendEventIpAddressRequest,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct RegionState {
    boot_config: BootConfig,
    boot_config_error: Option<RpcError>,
    boot_config_delay: Duration,
    boot_config_requests: Vec<GetBootConfigRequest>,
    mark_failed: Vec<MarkNodeFailedRequest>,
    mark_failed_error: Option<RpcError>,
    events: Vec<SendEventIpAddressRequest>,
}

/// Mock region connection recording every call it receives.
#[derive(Debug, Clone)]
pub struct MockRegionClient {
    ident: String,
    local_ident: String,
    state: Arc<Mutex<RegionState>>,
}

impl MockRegionClient {
    /// Region `ident` as seen from rack `local_ident`
    pub fn new(ident: impl Into<String>, local_ident: impl Into<String>) -> Self {
        Self {
            ident: ident.into(),
            local_ident: local_ident.into(),
            state: Arc::new(Mutex::new(RegionState::default())),
        }
    }

    /// Set the `GetBootConfig` response (for test setup)
    pub fn set_boot_config(&self, config: BootConfig) {
        let mut state = self.state.lock().unwrap();
        state.boot_config = config;
        state.boot_config_error = None;
    }

    /// Make `GetBootConfig` fail (for test setup)
    pub fn set_boot_config_error(&self, error: RpcError) {
        self.state.lock().unwrap().boot_config_error = Some(error);
    }

    /// Delay every `GetBootConfig` answer (for test setup)
    pub fn set_boot_config_delay(&self, delay: Duration) {
        self.state.lock().unwrap().boot_config_delay = delay;
    }

    /// Make `MarkNodeFailed` fail (for test setup)
    pub fn set_mark_failed_error(&self, error: RpcError) {
        self.state.lock().unwrap().mark_failed_error = Some(error);
    }

    /// Boot config requests seen so far
    pub fn boot_config_requests(&self) -> Vec<GetBootConfigRequest> {
        self.state.lock().unwrap().boot_config_requests.clone()
    }

    /// Nodes marked failed so far
    pub fn mark_failed_calls(&self) -> Vec<MarkNodeFailedRequest> {
        self.state.lock().unwrap().mark_failed.clone()
    }

    /// Events sent so far
    pub fn events(&self) -> Vec<SendEventIpAddressRequest> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait::async_trait]
impl RegionClient for MockRegionClient {
    fn ident(&self) -> &str {
        &self.ident
    }

    fn local_ident(&self) -> &str {
        &self.local_ident
    }

    async fn get_boot_config(&self, request: GetBootConfigRequest) -> std::result::Result<BootConfig, RpcError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.boot_config_requests.push(request);
            state.boot_config_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        match &state.boot_config_error {
            Some(error) => Err(error.clone()),
            None => Ok(state.boot_config.clone()),
        }
    }

    async fn mark_node_failed(&self, request: MarkNodeFailedRequest) -> std::result::Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.mark_failed.push(request);
        match &state.mark_failed_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn send_event_ip_address(
        &self,
        request: SendEventIpAddressRequest,
    ) -> std::result::Result<(), RpcError> {
        self.state.lock().unwrap().events.push(request);
        Ok(())
    }
}

/// Mock client service handing out [`MockRegionClient`]s in turn.
#[derive(Clone, Default)]
pub struct MockClientService {
    clients: Arc<Mutex<Vec<Arc<dyn RegionClient>>>>,
    calls: Arc<Mutex<usize>>,
}

impl MockClientService {
    /// Create a service over `clients`
    pub fn new(clients: Vec<MockRegionClient>) -> Self {
        let service = Self::default();
        service.set_clients(clients);
        service
    }

    /// Replace the live connections (for test setup)
    pub fn set_clients(&self, clients: Vec<MockRegionClient>) {
        *self.clients.lock().unwrap() = clients
            .into_iter()
            .map(|client| Arc::new(client) as Arc<dyn RegionClient>)
            .collect();
    }

    /// Number of `get_client_now` calls so far.
    pub fn client_now_calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl std::fmt::Debug for MockClientService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClientService")
            .field("clients", &self.clients.lock().unwrap().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ClientService for MockClientService {
    async fn get_client_now(&self) -> std::result::Result<Arc<dyn RegionClient>, RpcError> {
        let mut calls = self.calls.lock().unwrap();
        let clients = self.clients.lock().unwrap();
        if clients.is_empty() {
            return Err(RpcError::NoConnections);
        }
        let client = Arc::clone(&clients[*calls % clients.len()]);
        *calls += 1;
        Ok(client)
    }

    fn get_all_clients(&self) -> Vec<Arc<dyn RegionClient>> {
        self.clients.lock().unwrap().clone()
    }
}

/// In-memory image cache.
#[derive(Debug, Clone, Default)]
pub struct MockImageCache {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockImageCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cached file (for test setup)
    pub fn insert(&self, name: &str, content: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(name.trim_matches('/').to_string(), content.into());
    }

    /// File names requested so far
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ImageCache for MockImageCache {
    async fn get(&self, file_name: &str) -> Result<BootReader> {
        self.requests.lock().unwrap().push(file_name.to_string());
        let key = file_name.trim_matches('/');
        match self.files.lock().unwrap().get(key) {
            Some(content) => Ok(BootReader::from(content.clone())),
            None if is_optional(file_name) => Ok(BootReader::empty()),
            None => Err(PxeError::FileNotFound(file_name.to_string())),
        }
    }
}
