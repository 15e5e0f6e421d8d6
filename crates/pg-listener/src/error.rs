//! Listener service errors

use thiserror::Error;

/// Errors raised by the listener service
#[derive(Debug, Error)]
pub enum ListenerError {
    /// `register` was called after shutdown began
    #[error("Service is shutting down; cannot register {0}")]
    ShuttingDown(String),

    /// A system channel already has its one handler
    #[error("System channel '{0}' has already been registered")]
    SystemChannelTaken(String),

    /// `unregister` named a channel nobody registered
    #[error("Channel '{0}' is not registered")]
    ChannelNotRegistered(String),

    /// `unregister` named a handler that is not registered on the channel
    #[error("Handler is not registered on channel '{0}'")]
    HandlerNotRegistered(String),

    /// Channel names end up unquoted in LISTEN statements
    #[error("Invalid channel name '{0}'")]
    InvalidChannel(String),

    /// A notification's channel could not be mapped back to a registered channel and action
    #[error("Cannot dispatch notification: {0}")]
    Notify(String),

    /// No database connection is currently open
    #[error("Not connected to the database")]
    NotConnected,

    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for listener operations
pub type Result<T> = std::result::Result<T, ListenerError>;
