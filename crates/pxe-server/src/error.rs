//! PXE server errors

use thiserror::Error;

/// Internal failures inside the rack boot services.
#[derive(Debug, Error)]
pub enum PxeError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Render error: {0}")]
    Render(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Failures talking to a region controller.
///
/// Cloneable so one result can be handed to every caller sharing a coalesced request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The region had no boot configuration to give (`BootConfigNoResponse`).
    #[error("no boot configuration available")]
    NoResponse,

    #[error("no region connections available")]
    NoConnections,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("region error: {0}")]
    Remote(String),
}

/// What the TFTP and HTTP front ends see when a read cannot be served.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Backend(String),
}

/// Result type for rack boot operations
pub type Result<T> = std::result::Result<T, PxeError>;
