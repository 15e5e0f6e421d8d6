//! Coalescing of boot config requests
//!
//! Firmware retries aggressively, so one booting machine can have several identical
//! `GetBootConfig` calls in flight. Calls with the same client and arguments share a single
//! RPC while it is outstanding.

use crate::error::RpcError;
use crate::rpc::{BootConfig, GetBootConfigRequest, RegionClient};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type PendingFetch = Shared<BoxFuture<'static, Result<BootConfig, RpcError>>>;
type FetchKey = (String, GetBootConfigRequest);

/// Coalesces concurrent boot config requests with the same key into one region call.
#[derive(Default)]
pub struct BootConfigFetcher {
    pending: Mutex<HashMap<FetchKey, PendingFetch>>,
}

impl BootConfigFetcher {
    /// Fetcher with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks `client` for a boot config, joining an identical request already in flight.
    pub async fn fetch(
        &self,
        client: Arc<dyn RegionClient>,
        request: GetBootConfigRequest,
    ) -> Result<BootConfig, RpcError> {
        let key = (client.ident().to_string(), request.clone());

        let fetch = {
            let mut pending = self.lock();
            match pending.get(&key) {
                Some(fetch) => {
                    debug!("Joining in-flight boot config request for {}", request.remote_ip);
                    fetch.clone()
                }
                None => {
                    let fetch = async move { client.get_boot_config(request).await }
                        .boxed()
                        .shared();
                    pending.insert(key.clone(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        let mut pending = self.lock();
        if pending.get(&key).is_some_and(|current| current.ptr_eq(&fetch)) {
            pending.remove(&key);
        }
        result
    }

    /// Requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FetchKey, PendingFetch>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BootConfigFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootConfigFetcher")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
