//! In-memory connector for unit tests
//!
//! Records every statement executed and lets the test push notifications or sever the
//! connection without a running PostgreSQL.

use crate::connection::{Connector, ListenConnection, Notification, NotificationStream};
use crate::error::{ListenerError, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    statements: Vec<String>,
    sender: Option<mpsc::UnboundedSender<Result<Notification>>>,
    connects: usize,
    closed: usize,
    failing_connects: usize,
}

/// Mock connector for testing
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector").finish_non_exhaustive()
    }
}

impl MockConnector {
    /// Create a new mock connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connection attempts fail (for test setup)
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().unwrap().failing_connects = n;
    }

    /// Every statement executed so far, across connections
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    /// Number of connection attempts, failed ones included
    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    /// Number of connections closed by the service
    pub fn closed_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    /// Deliver a notification on the open connection. Returns false when not connected.
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .sender
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(Notification::new(channel, payload))).is_ok())
    }

    /// Sever the open connection as if the server went away
    pub fn drop_connection(&self) {
        self.state.lock().unwrap().sender = None;
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<(Box<dyn ListenConnection>, NotificationStream)> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ListenerError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.sender = Some(tx);
        Ok((
            Box::new(MockConnection {
                state: self.state.clone(),
            }),
            rx,
        ))
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

#[async_trait::async_trait]
impl ListenConnection for MockConnection {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.state.lock().unwrap().statements.push(statement.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed += 1;
        state.sender = None;
    }
}
