//! PostgreSQL LISTEN/NOTIFY listener service
//!
//! One service owns one dedicated database connection. Application code registers
//! handlers per channel; a registrar loop reconciles the channels the database is
//! listening on with the channels that have handlers, and a notifier loop drains queued
//! notifications to the handlers in batches. The connection is re-established after a
//! fixed delay whenever it is lost, for as long as the service runs.

use crate::channel::{
    is_system_channel, listen_statements, split_notify_channel, unlisten_statements,
    validate_channel_name,
};
use crate::connection::{Connector, ListenConnection, Notification, NotificationStream, PgConnector};
use crate::error::{ListenerError, Result};
use crate::queue::NotificationQueue;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a single handler invocation.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Receives notifications for a channel.
///
/// Ordinary channels call `handle(action, payload)`; system channels call
/// `handle(channel, payload)`. Plain async closures taking two `String`s implement this.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, action: &str, payload: &str) -> HandlerResult;
}

#[async_trait::async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, action: &str, payload: &str) -> HandlerResult {
        (self)(action.to_string(), payload.to_string()).await
    }
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Connected and listening on every registered channel
    Connected,
    /// Connection closed or lost, with the reason
    Disconnected(String),
}

/// Listener service settings
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// libpq-style connection string.
    pub database_url: String,
    /// Interval between drains of the notification queue
    pub notify_delay: Duration,
    /// Interval between registrar passes while channels are out of sync
    pub registrar_delay: Duration,
    /// Wait before reconnecting after a failed or lost connection
    pub reconnect_delay: Duration,
}

impl ListenerConfig {
    /// Config with the default delays.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            notify_delay: Duration::from_millis(500),
            registrar_delay: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

type HandlerRef = Arc<dyn NotificationHandler>;

#[derive(Default)]
struct State {
    listeners: HashMap<String, Vec<HandlerRef>>,
    registered_channels: HashSet<String>,
    queue: NotificationQueue,
    auto_reconnect: bool,
    shutting_down: bool,
    connected: bool,
}

impl State {
    fn converged(&self) -> bool {
        self.registered_channels.len() == self.listeners.len()
            && self
                .listeners
                .keys()
                .all(|channel| self.registered_channels.contains(channel))
    }
}

struct Inner {
    config: ListenerConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
    connection: tokio::sync::Mutex<Option<Box<dyn ListenConnection>>>,
    registrar_wakeup: Notify,
    events: broadcast::Sender<ListenerEvent>,
    /// Cancels the current run; replaced on every start.
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the listener service.
#[derive(Clone)]
pub struct PostgresListenerService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PostgresListenerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresListenerService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn same_handler(a: &HandlerRef, b: &HandlerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl PostgresListenerService {
    /// Creates a service that connects with `tokio-postgres`.
    pub fn new(config: ListenerConfig) -> Self {
        let connector = Arc::new(PgConnector::new(config.database_url.clone()));
        Self::with_connector(config, connector)
    }

    /// Creates a service over any [`Connector`].
    pub fn with_connector(config: ListenerConfig, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state: Mutex::new(State::default()),
                connection: tokio::sync::Mutex::new(None),
                registrar_wakeup: Notify::new(),
                events,
                cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Adds `handler` to `channel`.
    ///
    /// Fails once shutdown has begun, and when `channel` is a system channel that
    /// already has a handler. The database side is updated by the registrar.
    pub fn register(&self, channel: &str, handler: Arc<dyn NotificationHandler>) -> Result<()> {
        validate_channel_name(channel)?;
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(ListenerError::ShuttingDown(channel.to_string()));
            }
            let handlers = state.listeners.entry(channel.to_string()).or_default();
            if is_system_channel(channel) && !handlers.is_empty() {
                return Err(ListenerError::SystemChannelTaken(channel.to_string()));
            }
            handlers.push(handler);
        }
        debug!("Registered handler on channel {}", channel);
        self.inner.registrar_wakeup.notify_one();
        Ok(())
    }

    /// Removes `handler` from `channel`. Does nothing once shutdown has begun.
    pub fn unregister(&self, channel: &str, handler: &Arc<dyn NotificationHandler>) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Ok(());
            }
            let handlers = state
                .listeners
                .get_mut(channel)
                .ok_or_else(|| ListenerError::ChannelNotRegistered(channel.to_string()))?;
            let position = handlers
                .iter()
                .position(|h| same_handler(h, handler))
                .ok_or_else(|| ListenerError::HandlerNotRegistered(channel.to_string()))?;
            handlers.remove(position);
            if handlers.is_empty() {
                state.listeners.remove(channel);
            }
        }
        debug!("Unregistered handler from channel {}", channel);
        self.inner.registrar_wakeup.notify_one();
        Ok(())
    }

    /// Registers `handler` until the returned guard is dropped.
    pub fn listen(
        &self,
        channel: &str,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<ListenGuard> {
        self.register(channel, handler.clone())?;
        Ok(ListenGuard {
            service: self.clone(),
            channel: channel.to_string(),
            handler,
        })
    }

    /// Starts connecting in the background. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }
        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return Err(ListenerError::ShuttingDown("service".to_string()));
            }
            state.auto_reconnect = true;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        info!("Starting PostgreSQL listener service");
        *task = Some(tokio::spawn(Inner::run(self.inner.clone(), cancel)));
        Ok(())
    }

    /// Stops the service: no more reconnects, every channel unlistened, connection closed.
    /// Returns once the background task has finished; the service can then be started again
    /// and handlers registered on it as before.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state();
            state.auto_reconnect = false;
            state.shutting_down = true;
        }
        info!("Stopping PostgreSQL listener service");
        self.inner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Listener task failed: {}", e);
            }
        }
        self.inner.state().shutting_down = false;
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a session is up and its channels listened.
    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    /// Channels the database is currently listening on, sorted.
    pub fn registered_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> =
            self.inner.state().registered_channels.iter().cloned().collect();
        channels.sort();
        channels
    }

    /// Channels that have at least one handler, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.state().listeners.keys().cloned().collect();
        channels.sort();
        channels
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let attempt = tokio::select! {
                () = cancel.cancelled() => break,
                attempt = self.connector.connect() => attempt,
            };
            match attempt {
                Ok((connection, notifications)) => {
                    *self.connection.lock().await = Some(connection);
                    let reason = self.serve(notifications, &cancel).await;
                    self.disconnect(reason).await;
                }
                Err(e) => error!("Unable to connect to database: {}", e),
            }

            if cancel.is_cancelled() || !self.state().auto_reconnect {
                break;
            }
            debug!("Reconnecting in {:?}", self.config.reconnect_delay);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        debug!("Listener task finished");
    }

    /// Runs a connected session; returns why it ended.
    async fn serve(
        &self,
        notifications: NotificationStream,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if let Err(e) = self.register_channels().await {
            error!("Unable to listen on registered channels: {}", e);
            return Some(e.to_string());
        }
        self.state().connected = true;
        let _ = self.events.send(ListenerEvent::Connected);
        info!("Listening for database notifications");

        tokio::select! {
            () = cancel.cancelled() => None,
            reason = self.read_loop(notifications) => Some(reason),
            reason = self.registrar_loop() => Some(reason),
            () = self.notify_loop() => None,
        }
    }

    async fn disconnect(&self, reason: Option<String>) {
        let (was_connected, shutting_down, channels) = {
            let mut state = self.state();
            let was_connected = std::mem::replace(&mut state.connected, false);
            let channels: Vec<String> = state.registered_channels.drain().collect();
            (was_connected, state.shutting_down, channels)
        };

        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_mut() {
            if shutting_down {
                for channel in &channels {
                    for statement in unlisten_statements(channel) {
                        if let Err(e) = conn.execute(&statement).await {
                            warn!("Failed to unlisten {}: {}", channel, e);
                        }
                    }
                }
            }
            conn.close().await;
        }
        *connection = None;
        drop(connection);

        let reason = reason.unwrap_or_else(|| "connection closed".to_string());
        if shutting_down {
            debug!("Connection closed");
        } else {
            warn!("Connection lost: {}", reason);
        }
        if was_connected {
            let _ = self.events.send(ListenerEvent::Disconnected(reason));
        }
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let conn = connection.as_mut().ok_or(ListenerError::NotConnected)?;
        conn.execute(statement).await
    }

    async fn listen_channel(&self, channel: &str) -> Result<()> {
        debug!("Register channel {}", channel);
        for statement in listen_statements(channel) {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    async fn unlisten_channel(&self, channel: &str) -> Result<()> {
        debug!("Unregister channel {}", channel);
        for statement in unlisten_statements(channel) {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    /// One reconciliation pass. The registered set is updated after each channel.
    async fn register_channels(&self) -> Result<()> {
        let (mut to_listen, mut to_unlisten) = {
            let state = self.state();
            let to_listen: Vec<String> = state
                .listeners
                .keys()
                .filter(|channel| !state.registered_channels.contains(*channel))
                .cloned()
                .collect();
            let to_unlisten: Vec<String> = state
                .registered_channels
                .iter()
                .filter(|channel| !state.listeners.contains_key(*channel))
                .cloned()
                .collect();
            (to_listen, to_unlisten)
        };
        to_listen.sort();
        to_unlisten.sort();

        for channel in to_listen {
            self.listen_channel(&channel).await?;
            self.state().registered_channels.insert(channel);
        }
        for channel in to_unlisten {
            self.unlisten_channel(&channel).await?;
            self.state().registered_channels.remove(&channel);
        }
        Ok(())
    }

    async fn registrar_loop(&self) -> String {
        loop {
            self.registrar_wakeup.notified().await;
            loop {
                if let Err(e) = self.register_channels().await {
                    return e.to_string();
                }
                if self.state().converged() {
                    break;
                }
                tokio::time::sleep(self.config.registrar_delay).await;
            }
        }
    }

    async fn read_loop(&self, mut notifications: NotificationStream) -> String {
        loop {
            match notifications.recv().await {
                Some(Ok(notification)) => self.process_notification(notification).await,
                Some(Err(e)) => return e.to_string(),
                None => return "connection closed".to_string(),
            }
        }
    }

    /// System notifications go straight to their handler; the rest are queued.
    async fn process_notification(&self, notification: Notification) {
        if !is_system_channel(&notification.channel) {
            self.state().queue.push(notification);
            return;
        }

        let handler = self
            .state()
            .listeners
            .get(&notification.channel)
            .and_then(|handlers| handlers.first().cloned());
        match handler {
            Some(handler) => {
                if let Err(e) = handler
                    .handle(&notification.channel, &notification.payload)
                    .await
                {
                    error!(
                        "Failure while handling system notification to {}: {}",
                        notification.channel, e
                    );
                }
            }
            None => {
                warn!(
                    "No handler for system channel {}; unlistening",
                    notification.channel
                );
                if let Err(e) = self.unlisten_channel(&notification.channel).await {
                    error!("Failed to unlisten {}: {}", notification.channel, e);
                }
                let mut state = self.state();
                state.registered_channels.remove(&notification.channel);
                state.listeners.remove(&notification.channel);
            }
        }
    }

    async fn notify_loop(&self) {
        loop {
            tokio::time::sleep(self.config.notify_delay).await;
            self.handle_notifies().await;
        }
    }

    /// Drains the queue, oldest first, returning the number of failed handler calls.
    async fn handle_notifies(&self) -> usize {
        let notifications = self.state().queue.drain();
        let mut failures = 0;
        for notification in notifications {
            failures += self.handle_notify(&notification).await;
        }
        failures
    }

    async fn handle_notify(&self, notification: &Notification) -> usize {
        let dispatch = split_notify_channel(&notification.channel).and_then(|(channel, action)| {
            self.state()
                .listeners
                .get(channel)
                .cloned()
                .map(|handlers| (channel, action, handlers))
                .ok_or_else(|| {
                    ListenerError::Notify(format!("{channel} is not a registered channel"))
                })
        });
        let (channel, action, handlers) = match dispatch {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("Failed to convert channel {}: {}", notification.channel, e);
                return 0;
            }
        };

        let results = futures::future::join_all(
            handlers
                .iter()
                .map(|handler| handler.handle(action.as_str(), &notification.payload)),
        )
        .await;

        let mut failures = 0;
        for e in results.into_iter().filter_map(std::result::Result::err) {
            error!(
                "Failure while handling notification to {}: {}: {}",
                channel, notification.payload, e
            );
            failures += 1;
        }
        failures
    }
}

/// Scoped registration returned by [`PostgresListenerService::listen`].
pub struct ListenGuard {
    service: PostgresListenerService,
    channel: String,
    handler: Arc<dyn NotificationHandler>,
}

impl std::fmt::Debug for ListenGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenGuard")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        if let Err(e) = self.service.unregister(&self.channel, &self.handler) {
            warn!("Failed to unregister from {}: {}", self.channel, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> ListenerConfig {
        ListenerConfig {
            database_url: "postgres://mock".to_string(),
            notify_delay: Duration::from_millis(10),
            registrar_delay: Duration::from_millis(10),
            reconnect_delay: Duration::from_millis(20),
        }
    }

    fn service() -> (PostgresListenerService, MockConnector) {
        let connector = MockConnector::new();
        let service =
            PostgresListenerService::with_connector(fast_config(), Arc::new(connector.clone()));
        (service, connector)
    }

    fn recorder(calls: Arc<Mutex<Vec<(String, String)>>>) -> Arc<dyn NotificationHandler> {
        Arc::new(move |action: String, payload: String| {
            let calls = calls.clone();
            async move {
                calls.lock().unwrap().push((action, payload));
                Ok::<(), HandlerError>(())
            }
        })
    }

    fn counter(count: Arc<AtomicUsize>) -> Arc<dyn NotificationHandler> {
        Arc::new(move |_action: String, _payload: String| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_for(events: &mut broadcast::Receiver<ListenerEvent>, wanted: ListenerEvent) {
        let result = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if events.recv().await.unwrap() == wanted {
                    return;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for {wanted:?}");
    }

    #[tokio::test]
    async fn test_two_handlers_each_called_once() {
        let (service, connector) = service();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        service.register("node", counter(first.clone())).unwrap();
        service.register("node", counter(second.clone())).unwrap();

        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        assert!(connector.notify("node_update", "abc123"));
        eventually("both handlers", || {
            first.load(Ordering::SeqCst) == 1 && second.load(Ordering::SeqCst) == 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        service.stop().await;
    }

    #[tokio::test]
    async fn test_second_system_handler_rejected_before_database() {
        let (service, connector) = service();
        service
            .register("sys_dns", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let err = service
            .register("sys_dns", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert!(matches!(err, ListenerError::SystemChannelTaken(_)));
        assert_eq!(connector.connect_count(), 0);
        assert!(connector.statements().is_empty());
    }

    #[tokio::test]
    async fn test_listen_statements_issued_on_connect() {
        let (service, connector) = service();
        service
            .register("node", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        service
            .register("sys_core_1", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();

        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        assert_eq!(
            connector.statements(),
            vec![
                "LISTEN node_create;",
                "LISTEN node_delete;",
                "LISTEN node_update;",
                "LISTEN sys_core_1;",
            ]
        );
        assert_eq!(service.registered_channels(), vec!["node", "sys_core_1"]);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_unregister_last_handler_unlistens() {
        let (service, connector) = service();
        let handler = counter(Arc::new(AtomicUsize::new(0)));
        service.register("zone", handler.clone()).unwrap();

        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        service.unregister("zone", &handler).unwrap();
        eventually("zone unlistened", || service.registered_channels().is_empty()).await;
        let statements = connector.statements();
        assert!(statements.contains(&"UNLISTEN zone_create;".to_string()));
        assert!(statements.contains(&"UNLISTEN zone_delete;".to_string()));
        assert!(statements.contains(&"UNLISTEN zone_update;".to_string()));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_register_while_connected_listens() {
        let (service, connector) = service();
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        service
            .register("vlan", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        eventually("vlan listened", || service.registered_channels() == vec!["vlan"]).await;
        assert!(connector.statements().contains(&"LISTEN vlan_update;".to_string()));
        service.stop().await;
    }

    #[test]
    fn test_unregister_errors() {
        let (service, _connector) = service();
        let handler = counter(Arc::new(AtomicUsize::new(0)));
        let other = counter(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            service.unregister("node", &handler),
            Err(ListenerError::ChannelNotRegistered(_))
        ));
        service.register("node", handler.clone()).unwrap();
        assert!(matches!(
            service.unregister("node", &other),
            Err(ListenerError::HandlerNotRegistered(_))
        ));
        service.unregister("node", &handler).unwrap();
        assert!(service.channels().is_empty());
    }

    #[test]
    fn test_register_rejects_bad_channel_name() {
        let (service, _connector) = service();
        let handler = counter(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            service.register("node; SELECT 1", handler),
            Err(ListenerError::InvalidChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_system_notification_delivered_with_channel() {
        let (service, connector) = service();
        let calls = Arc::new(Mutex::new(Vec::new()));
        service.register("sys_dns", recorder(calls.clone())).unwrap();

        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        connector.notify("sys_dns", "reload");
        eventually("system handler", || !calls.lock().unwrap().is_empty()).await;
        assert_eq!(
            calls.lock().unwrap().clone(),
            vec![("sys_dns".to_string(), "reload".to_string())]
        );
        service.stop().await;
    }

    #[tokio::test]
    async fn test_system_notification_without_handler_unlistens() {
        let (service, connector) = service();
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        connector.notify("sys_ghost", "x");
        eventually("ghost unlistened", || {
            connector
                .statements()
                .contains(&"UNLISTEN sys_ghost;".to_string())
        })
        .await;
        service.stop().await;
    }

    #[tokio::test]
    async fn test_duplicates_collapse_and_order_is_kept() {
        let (service, connector) = service();
        let calls = Arc::new(Mutex::new(Vec::new()));
        service.register("node", recorder(calls.clone())).unwrap();

        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        for (channel, payload) in [
            ("node_update", "a"),
            ("node_update", "a"),
            ("node_create", "b"),
            ("node_update", "a"),
            ("node_delete", "c"),
        ] {
            connector.notify(channel, payload);
        }
        eventually("three deliveries", || calls.lock().unwrap().len() >= 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = calls.lock().unwrap().clone();
        // The first duplicate may land in an earlier batch than the third.
        let deduped: Vec<_> = calls.iter().filter(|(a, _)| a != "update").cloned().collect();
        assert_eq!(
            deduped,
            vec![
                ("create".to_string(), "b".to_string()),
                ("delete".to_string(), "c".to_string()),
            ]
        );
        assert!(calls.contains(&("update".to_string(), "a".to_string())));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_handle_notifies_isolates_failures() {
        let (service, _connector) = service();
        let count = Arc::new(AtomicUsize::new(0));
        let failing: Arc<dyn NotificationHandler> =
            Arc::new(|_action: String, _payload: String| async {
                Err::<(), HandlerError>("boom".into())
            });
        service.register("node", failing).unwrap();
        service.register("node", counter(count.clone())).unwrap();

        {
            let mut state = service.inner.state();
            state.queue.push(Notification::new("node_update", "1"));
            state.queue.push(Notification::new("node_rename", "2"));
            state.queue.push(Notification::new("zone_update", "3"));
            state.queue.push(Notification::new("node_delete", "4"));
        }
        let failures = service.inner.handle_notifies().await;
        assert_eq!(failures, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(service.inner.state().queue.is_empty());
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_lost() {
        let (service, connector) = service();
        service
            .register("node", counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        connector.drop_connection();
        wait_for(
            &mut events,
            ListenerEvent::Disconnected("connection closed".to_string()),
        )
        .await;
        wait_for(&mut events, ListenerEvent::Connected).await;

        assert_eq!(connector.connect_count(), 2);
        let listens = connector
            .statements()
            .iter()
            .filter(|s| s.as_str() == "LISTEN node_create;")
            .count();
        assert_eq!(listens, 2);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_retries_failed_connect() {
        let (service, connector) = service();
        connector.fail_next_connects(2);
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;
        assert_eq!(connector.connect_count(), 3);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unlistens_and_closes() {
        let (service, connector) = service();
        let handler = counter(Arc::new(AtomicUsize::new(0)));
        service.register("sys_dns", handler.clone()).unwrap();
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;

        service.stop().await;
        assert!(!service.is_connected());
        assert!(service.registered_channels().is_empty());
        assert_eq!(connector.statements().last().unwrap(), "UNLISTEN sys_dns;");
        assert_eq!(connector.closed_count(), 1);
        assert!(matches!(
            events.try_recv(),
            Ok(ListenerEvent::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (service, connector) = service();
        let handler = counter(Arc::new(AtomicUsize::new(0)));
        service.register("sys_dns", handler.clone()).unwrap();
        let mut events = service.subscribe();
        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;
        service.stop().await;

        service.start().unwrap();
        wait_for(&mut events, ListenerEvent::Connected).await;
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(service.registered_channels(), vec!["sys_dns".to_string()]);

        let count = Arc::new(AtomicUsize::new(0));
        service.register("node", counter(count.clone())).unwrap();
        eventually("node listened", || {
            service.registered_channels().contains(&"node".to_string())
        })
        .await;
        assert!(connector.notify("node_update", "abc"));
        eventually("node handler called", || count.load(Ordering::SeqCst) == 1).await;

        service.stop().await;
        assert_eq!(connector.closed_count(), 2);
        assert!(service.unregister("sys_dns", &handler).is_ok());
        assert_eq!(service.channels(), vec!["node".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_during_backoff_does_not_reconnect() {
        let (service, connector) = service();
        connector.fail_next_connects(1000);
        service.start().unwrap();
        eventually("first attempt", || connector.connect_count() >= 1).await;
        service.stop().await;
        let attempts = connector.connect_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.connect_count(), attempts);
    }

    #[tokio::test]
    async fn test_listen_guard_unregisters_on_drop() {
        let (service, _connector) = service();
        {
            let _guard = service
                .listen("node", counter(Arc::new(AtomicUsize::new(0))))
                .unwrap();
            assert_eq!(service.channels(), vec!["node"]);
        }
        assert!(service.channels().is_empty());
    }
}
