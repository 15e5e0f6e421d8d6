//! PostgreSQL LISTEN/NOTIFY event bus
//!
//! Region controller workers learn about row changes through [`PostgresListenerService`]
//! instead of polling. Handlers are registered per channel; the service keeps the
//! database's LISTEN set in step with the registered channels, batches and deduplicates
//! notifications, and reconnects on its own when the connection drops.
//!
//! # Example
//!
//! ```no_run
//! use pg_listener::{ListenerConfig, NotificationHandler, PostgresListenerService};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = PostgresListenerService::new(ListenerConfig::new("postgres://maas@localhost/maasdb"));
//! let handler: Arc<dyn NotificationHandler> = Arc::new(|action: String, payload: String| async move {
//!     println!("node {payload} {action}");
//!     Ok::<(), pg_listener::HandlerError>(())
//! });
//! service.register("node", handler)?;
//! service.start()?;
//! # service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod connection;
pub mod error;
pub mod notify;
pub mod queue;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use channel::{is_system_channel, Action, SYSTEM_CHANNEL_PREFIX};
pub use connection::{Connector, ListenConnection, Notification, NotificationStream, PgConnector};
pub use error::*;
pub use notify::{notify, notify_action};
pub use queue::NotificationQueue;
pub use service::{
    HandlerError, HandlerResult, ListenGuard, ListenerConfig, ListenerEvent, NotificationHandler,
    PostgresListenerService,
};

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockConnector;
