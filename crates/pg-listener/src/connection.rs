//! Database connection seam
//!
//! The listener service talks to the database only through [`Connector`] and
//! [`ListenConnection`], so tests can substitute an in-memory connection.

use crate::error::{ListenerError, Result};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, warn};

/// One `NOTIFY` received from the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    /// Database channel it arrived on, e.g. `node_update`.
    pub channel: String,
    /// Payload, often empty.
    pub payload: String,
}

impl Notification {
    /// Builds a notification as the server would deliver it.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Notifications from an open connection.
///
/// An `Err` item or the end of the stream means the connection is gone.
pub type NotificationStream = mpsc::UnboundedReceiver<Result<Notification>>;

/// An open connection able to run LISTEN/UNLISTEN.
#[async_trait::async_trait]
pub trait ListenConnection: Send {
    /// Runs a single simple-query statement.
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Shuts the connection down. The connection is dropped afterwards.
    async fn close(&mut self);
}

/// Opens listen connections.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn ListenConnection>, NotificationStream)>;
}

/// [`Connector`] backed by `tokio-postgres`.
#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    /// Connector for `database_url`, a libpq-style connection string.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<(Box<dyn ListenConnection>, NotificationStream)> {
        let (client, mut connection) = tokio_postgres::connect(&self.database_url, NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // The connection object drives the socket; notifications only surface through
        // poll_message, so it gets a task of its own.
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let notification = Notification::new(n.channel(), n.payload());
                        if tx.send(Ok(notification)).is_err() {
                            debug!("Notification receiver dropped; stopping connection driver");
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!("Database notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Database connection error: {}", e);
                        if tx.send(Err(ListenerError::Database(e))).is_err() {
                            debug!("Notification receiver dropped before the connection error");
                        }
                        break;
                    }
                }
            }
        });

        Ok((Box::new(PgListenConnection { client, driver }), rx))
    }
}

struct PgListenConnection {
    client: Client,
    driver: JoinHandle<()>,
}

#[async_trait::async_trait]
impl ListenConnection for PgListenConnection {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.client.batch_execute(statement).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.driver.abort();
    }
}
