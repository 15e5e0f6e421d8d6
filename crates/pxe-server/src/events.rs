//! Node events sent to the region

use crate::error::RpcError;
use crate::rpc::{ClientService, NodeEventType, SendEventIpAddressRequest};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Reports `event` for the node at `ip` in the background.
///
/// The report starts on a later scheduler turn so the request being served is not held up.
/// Failures are logged and otherwise ignored.
pub fn send_node_event_ip_address(
    client_service: Arc<dyn ClientService>,
    event: NodeEventType,
    ip: IpAddr,
    description: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        let result: Result<(), RpcError> = async {
            let client = client_service.get_client_now().await?;
            client
                .send_event_ip_address(SendEventIpAddressRequest {
                    type_name: event.to_string(),
                    ip_address: ip.to_string(),
                    description,
                })
                .await
        }
        .await;
        if let Err(e) = result {
            warn!("Logging {} request failed: {}", event, e);
        }
    })
}
