//! Region listener
//!
//! Connects to the region database, listens on the configured channels and logs every
//! notification it receives along with connection state changes.

use anyhow::{Context, Result};
use pg_listener::{ListenerConfig, ListenerEvent, NotificationHandler, PostgresListenerService};
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CHANNELS: &str = "node,machine,controller,subnet,vlan";

/// Channel names from a comma separated list, blanks dropped.
fn parse_channels(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|channel| !channel.is_empty())
        .map(str::to_string)
        .collect()
}

fn logging_handler(channel: String) -> Arc<dyn NotificationHandler> {
    Arc::new(move |action: String, payload: String| {
        let channel = channel.clone();
        async move {
            info!(channel = %channel, action = %action, "{}", payload);
            Ok::<(), pg_listener::HandlerError>(())
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting region listener");

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;
    let channels = parse_channels(&env::var("LISTEN_CHANNELS").unwrap_or_else(|_| DEFAULT_CHANNELS.to_string()));
    info!("Listening on channels: {}", channels.join(", "));

    let service = PostgresListenerService::new(ListenerConfig::new(database_url));
    for channel in &channels {
        service
            .register(channel, logging_handler(channel.clone()))
            .with_context(|| format!("registering channel {channel}"))?;
    }

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ListenerEvent::Connected) => info!("Connected to the region database"),
                Ok(ListenerEvent::Disconnected(reason)) => warn!("Disconnected from the region database: {}", reason),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} connection events", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    service.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    service.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels() {
        assert_eq!(parse_channels("node, machine,,subnet "), vec!["node", "machine", "subnet"]);
        assert!(parse_channels("").is_empty());
    }

    #[tokio::test]
    async fn test_logging_handler_accepts_notifications() {
        let handler = logging_handler("node".to_string());
        assert!(handler.handle("update", "abc123").await.is_ok());
    }
}
