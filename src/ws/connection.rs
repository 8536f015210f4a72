#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_stream::try_stream;
use async_trait::async_trait;
use backoff::backoff::{Backoff as _, Constant};
use futures::{SinkExt as _, Stream, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::config::Config;
use super::error::WsError;
use super::heartbeat::HeartbeatMonitor;
use super::subscription::SubscriptionTracker;
use super::traits::ConnectionObserver;
use crate::protocol::request::ClientCommand;
use crate::protocol::response::{self, ServerEvent};
use crate::services::{ConnectionControl, IdentifierMap};
use crate::{EquipmentId, Result, protocol};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for incoming events.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Reconnecting after an unexpected close
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
    /// Terminal: explicit disconnect, or reconnect attempts exhausted
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Owns the transport and drives connect/disconnect/reconnect.
///
/// The manager is the only writer of [`ConnectionState`]. An unexpected close
/// of an established connection triggers the automatic reconnect sequence
/// (bounded attempts, constant delay), after which the full subscription set
/// is replayed. Mutations to the subscription set made while disconnected are
/// retained and flushed on the next successful connect.
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionManager::new(
///     "wss://status.example.com/stream",
///     Config::default(),
///     Arc::new(PassthroughIdentifiers),
///     Arc::new(NoopObserver),
/// )?;
///
/// connection.subscribe(&[10, 20])?; // retained until connected
/// connection.connect().await?;      // flushes {10, 20}
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    config: Config,
    /// Watch channel sender for state changes (enables reconnection detection)
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver kept so state sends never observe a closed channel
    state_rx: watch::Receiver<ConnectionState>,
    tracker: SubscriptionTracker,
    translator: Arc<dyn IdentifierMap>,
    observer: Arc<dyn ConnectionObserver>,
    heartbeat: HeartbeatMonitor,
    /// Broadcast sender fanning decoded events out to subscribers
    broadcast_tx: broadcast::Sender<ServerEvent>,
    /// Outbound sender of the live session, if one exists
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Version string captured from the server's handshake acknowledgment
    server_version: Mutex<Option<String>>,
    /// Consecutive reconnect attempt counter; reset on every transport open
    attempts: AtomicU32,
    /// Raised by an explicit disconnect before the transport closes, so the
    /// session driver does not treat the close as abnormal
    shutdown: AtomicBool,
    driver_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes concurrent connect() calls
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a new connection manager. No connection is opened until
    /// [`connect`](Self::connect) is called.
    pub fn new(
        endpoint: &str,
        config: Config,
        translator: Arc<dyn IdentifierMap>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self> {
        if !endpoint.starts_with("ws://") && !endpoint.starts_with("wss://") {
            return Err(crate::error::Error::validation(
                "endpoint must use a ws or wss scheme",
            ));
        }

        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.to_owned(),
                config,
                state_tx,
                state_rx,
                tracker: SubscriptionTracker::new(),
                translator,
                observer,
                heartbeat: HeartbeatMonitor::new(),
                broadcast_tx,
                outbound_tx: Mutex::new(None),
                server_version: Mutex::new(None),
                attempts: AtomicU32::new(0),
                shutdown: AtomicBool::new(false),
                driver_task: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Open the connection.
    ///
    /// Returns `Ok(true)` once connected, including when the connection was
    /// already open. Returns `Ok(false)` without any transition when a
    /// connect or reconnect is already in progress. A transport failure
    /// leaves the state `Disconnected` and surfaces as an error; it does not
    /// start the automatic reconnect sequence, which is reserved for an
    /// unexpected close of an established connection.
    pub async fn connect(&self) -> Result<bool> {
        match self.state() {
            ConnectionState::Connected { .. } => return Ok(true),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                return Ok(false);
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {}
        }

        let _guard = self.inner.connect_lock.lock().await;
        // Re-check: another caller may have raced us to the lock.
        match self.state() {
            ConnectionState::Connected { .. } => return Ok(true),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                return Ok(false);
            }
            ConnectionState::Disconnected | ConnectionState::Closed => {}
        }

        self.inner.shutdown.store(false, Ordering::Release);
        self.inner.set_state(ConnectionState::Connecting);

        match connect_async(&self.inner.endpoint).await {
            Ok((ws_stream, _)) => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                self.inner.install_outbound(outbound_tx);

                let driver = tokio::spawn(Inner::session_driver(
                    Arc::clone(&self.inner),
                    ws_stream,
                    outbound_rx,
                ));
                *lock(&self.inner.driver_task) = Some(driver);

                self.inner.on_transport_open();
                Ok(true)
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                Err(WsError::Connection(e).into())
            }
        }
    }

    /// Close the connection for good.
    ///
    /// Cancels any pending reconnect timer, stops the heartbeat and clears
    /// the subscription tracker's resend flag; the set itself is kept for a
    /// later reconnect. The shutdown flag is raised before the transport
    /// drops so the resulting close does not trigger auto-reconnect.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        self.inner.shutdown.store(true, Ordering::Release);

        if let Some(driver) = lock(&self.inner.driver_task).take() {
            // Also cancels a reconnect sequence sleeping inside the driver.
            driver.abort();
        }
        if let Some(heartbeat) = lock(&self.inner.heartbeat_task).take() {
            heartbeat.abort();
        }
        self.inner.clear_outbound();
        self.inner.tracker.clear_dirty();

        self.inner.set_state(ConnectionState::Closed);
        self.inner.observer.on_disconnected();
    }

    /// Track the given equipment units and, when connected, subscribe on the
    /// wire immediately. While disconnected the mutation is retained and
    /// flushed on the next successful connect.
    ///
    /// Identifiers already tracked never produce a duplicate subscribe
    /// command.
    pub fn subscribe(&self, ids: &[EquipmentId]) -> Result<()> {
        let added = self.inner.tracker.add_many(ids);

        if !self.state().is_connected() {
            self.inner.tracker.mark_dirty();
            tracing::debug!(
                count = ids.len(),
                "subscription retained while disconnected"
            );
            return Ok(());
        }
        if added.is_empty() {
            return Ok(());
        }
        self.inner.send_command(&ClientCommand::subscribe(added))
    }

    /// Single-identifier convenience for [`subscribe`](Self::subscribe).
    pub fn subscribe_equipment(&self, id: EquipmentId) -> Result<()> {
        self.subscribe(&[id])
    }

    /// Stop tracking the given equipment units and, when connected,
    /// unsubscribe on the wire immediately.
    pub fn unsubscribe(&self, ids: &[EquipmentId]) -> Result<()> {
        let removed = self.inner.tracker.remove_many(ids);

        if !self.state().is_connected() {
            self.inner.tracker.mark_dirty();
            tracing::debug!(
                count = ids.len(),
                "unsubscription retained while disconnected"
            );
            return Ok(());
        }
        if removed.is_empty() {
            return Ok(());
        }
        self.inner.send_command(&ClientCommand::unsubscribe(removed))
    }

    /// Request a one-shot status report for the given equipment units.
    /// Unlike subscription mutations, a query is not retained while
    /// disconnected.
    pub fn request_status(&self, ids: &[EquipmentId]) -> Result<()> {
        if !self.state().is_connected() {
            return Err(WsError::NotConnected.into());
        }
        self.inner
            .send_command(&ClientCommand::get_status(ids.to_vec()))
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies when the connection state changes.
    /// This is useful for detecting reconnections and terminal closure.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to decoded server events.
    ///
    /// Each call returns a new independent receiver. Multiple subscribers can
    /// receive events concurrently without blocking each other.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Typed stream of status updates, translated into the internal
    /// identifier space. Updates for equipment the translator does not know
    /// are dropped.
    pub fn status_updates(
        &self,
    ) -> impl Stream<Item = Result<(EquipmentId, response::StatusUpdate)>> + use<> {
        let mut rx = self.events();
        let translator = Arc::clone(&self.inner.translator);

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(ServerEvent::EquipmentStatus(update)) => {
                        if let Some(id) = translator.translate(update.equipment_id) {
                            yield (id, update);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        tracing::warn!(count, "status update stream lagged");
                        Err(WsError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Version string from the server's handshake acknowledgment, if one was
    /// received on the current or a previous session.
    #[must_use]
    pub fn server_version(&self) -> Option<String> {
        lock(&self.inner.server_version).clone()
    }

    /// When the most recent heartbeat acknowledgment arrived.
    #[must_use]
    pub fn last_heartbeat_ack(&self) -> Option<Instant> {
        self.inner.heartbeat.last_ack()
    }

    /// The set of currently tracked equipment identifiers, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<EquipmentId> {
        self.inner.tracker.snapshot()
    }

    /// Number of tracked equipment identifiers.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.tracker.len()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        _ = self.state_tx.send(state);
    }

    fn install_outbound(&self, tx: mpsc::UnboundedSender<String>) {
        *lock(&self.outbound_tx) = Some(tx);
    }

    fn clear_outbound(&self) {
        *lock(&self.outbound_tx) = None;
    }

    fn current_outbound(&self) -> Option<mpsc::UnboundedSender<String>> {
        lock(&self.outbound_tx).clone()
    }

    fn send_command(&self, command: &ClientCommand) -> Result<()> {
        let json = protocol::encode(command)?;
        match self.current_outbound() {
            Some(tx) => tx
                .send(json)
                .map_err(|_e| WsError::ConnectionClosed.into()),
            None => Err(WsError::NotConnected.into()),
        }
    }

    /// Transition into `Connected` after a transport open, replay the
    /// subscription set and notify the observer.
    fn on_transport_open(&self) {
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });
        self.attempts.store(0, Ordering::Release);
        self.flush_subscriptions();
        self.observer.on_connected();
    }

    /// Send the full tracked set in one subscribe command.
    fn flush_subscriptions(&self) {
        self.tracker.clear_dirty();
        let snapshot = self.tracker.snapshot();
        if snapshot.is_empty() {
            return;
        }
        tracing::debug!(count = snapshot.len(), "replaying subscription set");
        if let Err(e) = self.send_command(&ClientCommand::subscribe(snapshot)) {
            tracing::warn!(error = %e, "failed to replay subscription set");
        }
    }

    /// Drives one connection across its sessions: runs the message loop and,
    /// after an unexpected close, the bounded reconnect sequence.
    async fn session_driver(
        inner: Arc<Self>,
        ws_stream: WsStream,
        outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        let mut ws_stream = ws_stream;
        let mut outbound_rx = outbound_rx;

        loop {
            Self::run_session(&inner, ws_stream, &mut outbound_rx).await;
            inner.clear_outbound();

            if inner.shutdown.load(Ordering::Acquire) {
                // Explicit disconnect already handled state and callbacks.
                return;
            }

            inner.set_state(ConnectionState::Disconnected);
            inner.observer.on_disconnected();

            if !inner.config.auto_reconnect {
                return;
            }

            let Some(stream) = Self::reconnect_sequence(&inner).await else {
                return;
            };

            let (outbound_tx, rx) = mpsc::unbounded_channel();
            inner.install_outbound(outbound_tx);
            outbound_rx = rx;
            ws_stream = stream;
            inner.on_transport_open();
        }
    }

    /// Bounded reconnection with constant delay. Returns the fresh transport,
    /// or `None` once attempts are exhausted (terminal `Closed`) or shutdown
    /// was requested meanwhile.
    async fn reconnect_sequence(inner: &Arc<Self>) -> Option<WsStream> {
        let mut backoff: Constant = inner.config.reconnect.clone().into();
        let max_attempts = inner.config.reconnect.max_attempts;

        loop {
            let attempt = inner.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            if attempt > max_attempts {
                tracing::warn!(
                    max_attempts,
                    "reconnect attempts exhausted, closing connection"
                );
                inner.set_state(ConnectionState::Closed);
                return None;
            }

            inner.set_state(ConnectionState::Reconnecting { attempt });
            inner.observer.on_reconnecting(attempt, max_attempts);

            if let Some(delay) = backoff.next_backoff() {
                sleep(delay).await;
            }

            if inner.shutdown.load(Ordering::Acquire) {
                return None;
            }

            match connect_async(&inner.endpoint).await {
                Ok((stream, _)) => return Some(stream),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
    }

    /// Message loop for one live session. Returns when the session ends,
    /// for any reason.
    async fn run_session(
        inner: &Arc<Self>,
        ws_stream: WsStream,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) {
        let (mut write, mut read) = ws_stream.split();
        let (stale_tx, mut stale_rx) = mpsc::unbounded_channel();

        let heartbeat_handle = inner.current_outbound().and_then(|outbound| {
            inner
                .heartbeat
                .start(&inner.config, outbound, inner.state_tx.subscribe(), stale_tx)
        });
        *lock(&inner.heartbeat_task) = heartbeat_handle;

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => inner.dispatch(text.as_bytes()),
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::debug!("status feed closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary and control frames are not part of the protocol.
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "transport error on status feed");
                            if inner.state_rx.borrow().is_connected() {
                                inner.observer.on_error(&e.to_string());
                            }
                            break;
                        }
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                Some(()) = stale_rx.recv() => {
                    tracing::warn!("terminating session after missed heartbeat acknowledgment");
                    break;
                }
            }
        }

        if let Some(handle) = lock(&inner.heartbeat_task).take() {
            handle.abort();
        }
    }

    /// Dispatch one inbound frame. Decode failures are logged and dropped;
    /// they never affect subsequent messages.
    fn dispatch(&self, bytes: &[u8]) {
        let event = match response::decode(bytes) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!("ignoring message with unknown type tag");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode status feed message");
                return;
            }
        };

        match &event {
            ServerEvent::Connected(ack) => {
                tracing::debug!(version = ?ack.version, "status feed handshake acknowledged");
                *lock(&self.server_version) = ack.version.clone();
            }
            ServerEvent::Subscribed(ack) => self.tracker.reconcile_subscribed(&ack.equipment_ids),
            ServerEvent::Unsubscribed(ack) => {
                self.tracker.reconcile_unsubscribed(&ack.equipment_ids);
            }
            ServerEvent::EquipmentStatus(update) => {
                match self.translator.translate(update.equipment_id) {
                    Some(internal) => self.observer.on_status_update(internal, update),
                    None => tracing::debug!(
                        external_id = update.equipment_id,
                        "dropping status update for unmapped equipment"
                    ),
                }
            }
            ServerEvent::Pong(_) => self.heartbeat.record_ack(),
            ServerEvent::Error(err) => {
                tracing::warn!(message = %err.message, "status feed reported an error");
                self.observer.on_error(&err.message);
            }
        }

        _ = self.broadcast_tx.send(event);
    }
}

#[async_trait]
impl ConnectionControl for ConnectionManager {
    async fn ensure_connected(&self) -> Result<bool> {
        self.connect().await
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }

    fn replay_subscriptions(&self) -> Result<usize> {
        if !self.state().is_connected() {
            return Err(WsError::NotConnected.into());
        }
        let snapshot = self.inner.tracker.snapshot();
        let count = snapshot.len();
        if count > 0 {
            self.inner.send_command(&ClientCommand::subscribe(snapshot))?;
        }
        Ok(count)
    }

    fn is_online(&self) -> bool {
        self.state().is_connected()
    }
}

/// Recover from a poisoned lock; none of the guarded values has an
/// inconsistent intermediate state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
