//! Startup/shutdown sequencing for the whole synchronization service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bon::Builder;
use serde::Serialize;
use serde_with::{DurationMilliSeconds, serde_as};
use strum_macros::Display;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

use crate::error::Error;
use crate::notify::NotificationEmitter;
use crate::protocol::response::{ServerEvent, StatusUpdate};
use crate::services::{
    AlternateSync as _, BaselineLoader as _, Collaborators, IdentifierMap as _, LifecycleControl,
    Presenter as _, SyncStrategy,
};
use crate::status::StatusCache;
use crate::ws::config::Config;
use crate::ws::connection::{ConnectionManager, ConnectionState};
use crate::{EquipmentId, Result};

/// Overall service state, one level above the transport connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Restarting,
    Error,
}

/// Tunables for startup/shutdown sequencing.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct LifecycleOptions {
    /// Window passed to the baseline loader; entities silent for longer are
    /// considered stale by the source.
    #[builder(default = 24)]
    pub baseline_threshold_hours: u32,
    /// Cadence of the batched status flush. [`Duration::ZERO`] disables
    /// batching: updates are applied to the cache as they arrive.
    #[builder(default = Duration::from_secs(2))]
    pub flush_interval: Duration,
    /// Pause between stop and start during a full restart.
    #[builder(default = Duration::from_millis(500))]
    pub restart_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Snapshot emitted with the "start complete" notification.
#[non_exhaustive]
#[serde_as]
#[derive(Clone, Debug, Serialize)]
pub struct StartReport {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "elapsed_ms")]
    pub elapsed: Duration,
    /// Whether the feed answered during startup. An unreachable feed does not
    /// fail the start; it is left to auto-reconnect and recovery.
    pub connection_reachable: bool,
    /// Whether baseline loading had to take the legacy path.
    pub used_legacy_loader: bool,
    pub baseline_entities: usize,
}

/// Sequences the multi-step startup, guarantees idempotent start/stop, and
/// rolls back partial startup on error.
///
/// Startup order: reset overlays → baseline load (legacy fallback) → open
/// connection and flush subscriptions → begin the periodic batch flush →
/// subscribe the internal status listener. Any step failing tears the
/// partial state down and reports `false`; nothing is thrown at callers.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    state_tx: watch::Sender<LifecycleState>,
    state_rx: watch::Receiver<LifecycleState>,
    connection: ConnectionManager,
    cache: Arc<StatusCache>,
    collaborators: Collaborators,
    emitter: Arc<NotificationEmitter>,
    options: LifecycleOptions,
    active: AtomicBool,
    /// Status updates queued between flushes.
    pending: Mutex<Vec<(EquipmentId, StatusUpdate)>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    state_watch_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes start sequences so concurrent callers observe one
    /// initialization.
    start_lock: tokio::sync::Mutex<()>,
}

impl LifecycleController {
    /// Compose the service. No connection is opened and no timer runs until
    /// [`start`](Self::start).
    pub fn new(
        endpoint: &str,
        config: Config,
        collaborators: Collaborators,
        options: LifecycleOptions,
    ) -> Result<Self> {
        let connection = ConnectionManager::new(
            endpoint,
            config,
            Arc::clone(&collaborators.translator),
            Arc::clone(&collaborators.observer),
        )?;
        let emitter = Arc::new(NotificationEmitter::new(
            Arc::clone(&collaborators.bus),
            Arc::clone(&collaborators.alerts),
        ));
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);

        Ok(Self {
            inner: Arc::new(LifecycleInner {
                state_tx,
                state_rx,
                connection,
                cache: Arc::new(StatusCache::new()),
                collaborators,
                emitter,
                options,
                active: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                flush_task: Mutex::new(None),
                listener_task: Mutex::new(None),
                state_watch_task: Mutex::new(None),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// The underlying connection manager.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// The status cache owned by this service.
    #[must_use]
    pub fn cache(&self) -> &Arc<StatusCache> {
        &self.inner.cache
    }

    /// The notification emitter wired to the injected bus and alert sink.
    #[must_use]
    pub fn emitter(&self) -> &Arc<NotificationEmitter> {
        &self.inner.emitter
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether the service completed startup and has not been stopped since.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Start the service. Idempotent: while a start is in flight, concurrent
    /// callers wait for it and receive its outcome; when already running,
    /// returns `true` immediately. Any failure rolls the partial startup back
    /// and returns `false`.
    pub async fn start(&self) -> bool {
        if self.state() == LifecycleState::Running {
            return true;
        }
        let joined_in_flight = self.state() == LifecycleState::Starting;

        let _guard = self.inner.start_lock.lock().await;
        if joined_in_flight || self.state() == LifecycleState::Running {
            // A start that was in flight when we arrived has finished;
            // report its outcome instead of initializing twice.
            return self.state() == LifecycleState::Running;
        }

        self.inner.set_state(LifecycleState::Starting);
        let started = Instant::now();

        match self.run_start_sequence().await {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                self.inner.set_state(LifecycleState::Running);
                self.inner.active.store(true, Ordering::Release);
                tracing::info!(
                    elapsed = ?report.elapsed,
                    reachable = report.connection_reachable,
                    used_legacy = report.used_legacy_loader,
                    "service started"
                );
                self.inner.emitter.lifecycle_started(&report);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "startup failed, rolling back");
                self.rollback();
                self.inner.emitter.lifecycle_start_failed(&e.to_string());
                false
            }
        }
    }

    /// Stop the service. Idempotent; a no-op when already idle.
    pub async fn stop(&self) {
        if self.state() == LifecycleState::Idle {
            return;
        }

        self.inner.set_state(LifecycleState::Stopping);
        self.abort_tasks();
        self.inner.collaborators.presenter.reset_overlays();
        self.inner.connection.disconnect().await;
        self.inner.active.store(false, Ordering::Release);
        self.inner.set_state(LifecycleState::Idle);
        self.inner.emitter.lifecycle_stopped();
        tracing::info!("service stopped");
    }

    /// Restart the service.
    ///
    /// With `full_restart` the whole stop/start sequence runs, separated by
    /// the configured delay. Without it, only the connection layer is
    /// recovered, trying in fixed preference order: the alternate sync
    /// strategy, the primary loader's dedicated reconnect, then recycling the
    /// raw connection. The first method that reports success wins.
    pub async fn restart(&self, full_restart: bool) -> bool {
        if full_restart {
            self.stop().await;
            if !self.inner.options.restart_delay.is_zero() {
                sleep(self.inner.options.restart_delay).await;
            }
            return self.start().await;
        }

        self.inner.set_state(LifecycleState::Restarting);
        let recovered = self.recover_connection_layer().await;
        if recovered {
            self.inner.set_state(LifecycleState::Running);
            self.inner.active.store(true, Ordering::Release);
        } else {
            tracing::warn!("every connection-layer recovery method failed");
            self.inner.set_state(LifecycleState::Error);
        }
        recovered
    }

    async fn run_start_sequence(&self) -> Result<StartReport> {
        let inner = &self.inner;

        inner.collaborators.presenter.reset_overlays();

        // Baseline load, falling back to the legacy loader when the primary
        // path fails.
        let threshold = inner.options.baseline_threshold_hours;
        let (snapshot, used_legacy_loader) =
            match inner.collaborators.loader.load(threshold).await {
                Ok(snapshot) => (snapshot, false),
                Err(primary_error) => {
                    tracing::warn!(
                        error = %primary_error,
                        "primary baseline loader failed, taking the legacy path"
                    );
                    match inner.collaborators.legacy_loader.load(threshold).await {
                        Ok(snapshot) => (snapshot, true),
                        Err(legacy_error) => {
                            return Err(Error::lifecycle(format!(
                                "baseline load failed on both paths: {primary_error}; {legacy_error}"
                            )));
                        }
                    }
                }
            };
        let baseline_entities = snapshot.entities.len();
        for record in &snapshot.entities {
            inner.cache.apply_baseline(record);
        }
        if let Some(summary) = &snapshot.summary {
            tracing::debug!(%summary, baseline_entities, "baseline loaded");
        }

        // Open the feed and flush subscriptions. An unreachable feed is
        // reported in the start notification, not treated as fatal.
        let connection_reachable = match inner.connection.connect().await {
            Ok(_) => inner.connection.state().is_connected(),
            Err(e) => {
                tracing::warn!(error = %e, "status feed unreachable during startup");
                false
            }
        };

        self.spawn_flush_task();
        self.spawn_listener_task();
        self.spawn_state_watch_task();

        Ok(StartReport {
            elapsed: Duration::ZERO,
            connection_reachable,
            used_legacy_loader,
            baseline_entities,
        })
    }

    /// Periodic batch flush of queued status updates into the cache.
    fn spawn_flush_task(&self) {
        if self.inner.options.flush_interval.is_zero() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut flush_interval = interval(inner.options.flush_interval);
            flush_interval.tick().await;

            loop {
                flush_interval.tick().await;

                let batch = {
                    let mut pending = lock(&inner.pending);
                    std::mem::take(&mut *pending)
                };
                if batch.is_empty() {
                    continue;
                }

                let count = batch.len();
                for (equipment_id, update) in batch {
                    inner.cache.apply(equipment_id, &update);
                }
                tracing::trace!(count, "flushed status batch");
                inner.emitter.status_batch(count);
            }
        });
        *lock(&self.inner.flush_task) = Some(handle);
    }

    /// Single internal listener on the connection's event broadcast; external
    /// event sources are adapted into the same abstraction upstream.
    fn spawn_listener_task(&self) {
        let inner = Arc::clone(&self.inner);
        let mut events = self.inner.connection.events();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerEvent::EquipmentStatus(update)) => {
                        let Some(equipment_id) =
                            inner.collaborators.translator.translate(update.equipment_id)
                        else {
                            continue;
                        };
                        if inner.options.flush_interval.is_zero() {
                            inner.cache.apply(equipment_id, &update);
                        } else {
                            lock(&inner.pending).push((equipment_id, update));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "status listener lagged behind the feed");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock(&self.inner.listener_task) = Some(handle);
    }

    /// Watches connection state transitions and surfaces them as
    /// notifications. Deliberate teardowns (stop, connection-layer restart)
    /// are not reported as failures.
    fn spawn_state_watch_task(&self) {
        let inner = Arc::clone(&self.inner);
        let max_attempts = self.inner.connection.config().reconnect.max_attempts;
        let mut state_rx = self.inner.connection.state_receiver();

        let handle = tokio::spawn(async move {
            let mut was_connected = state_rx.borrow().is_connected();
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected { .. } => {
                        if !was_connected {
                            inner
                                .emitter
                                .connection_established(inner.connection.server_version().as_deref());
                        }
                        was_connected = true;
                    }
                    ConnectionState::Disconnected => {
                        if was_connected {
                            inner.emitter.connection_lost();
                        }
                        was_connected = false;
                    }
                    ConnectionState::Reconnecting { attempt } => {
                        inner.emitter.reconnecting(attempt, max_attempts);
                        was_connected = false;
                    }
                    ConnectionState::Closed => {
                        // Terminal only when the service still expects a feed;
                        // a connection-layer restart recycles deliberately.
                        if inner.active.load(Ordering::Acquire)
                            && *inner.state_rx.borrow() != LifecycleState::Restarting
                        {
                            inner.emitter.connection_closed();
                        }
                        was_connected = false;
                    }
                    ConnectionState::Connecting => {}
                }
            }
        });
        *lock(&self.inner.state_watch_task) = Some(handle);
    }

    /// Tear down everything a partially completed start may have created.
    fn rollback(&self) {
        self.abort_tasks();
        self.inner.active.store(false, Ordering::Release);
        self.inner.set_state(LifecycleState::Error);
    }

    fn abort_tasks(&self) {
        if let Some(handle) = lock(&self.inner.flush_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.listener_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.state_watch_task).take() {
            handle.abort();
        }
        lock(&self.inner.pending).clear();
    }

    async fn recover_connection_layer(&self) -> bool {
        // Fixed preference order; the first method that reports success wins.
        if let SyncStrategy::Alternate(alternate) = &self.inner.collaborators.sync_strategy {
            match alternate.resync().await {
                Ok(true) => {
                    tracing::debug!("alternate sync path recovered the connection layer");
                    return true;
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "alternate sync path failed"),
            }
        }

        match self.inner.collaborators.loader.reconnect().await {
            Ok(true) => {
                tracing::debug!("primary loader reconnect recovered the connection layer");
                return true;
            }
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "primary loader reconnect failed"),
        }

        // Last resort: recycle the raw connection. A successful connect
        // replays the subscription set.
        self.inner.connection.disconnect().await;
        match self.inner.connection.connect().await {
            Ok(_) => self.inner.connection.state().is_connected(),
            Err(e) => {
                tracing::warn!(error = %e, "raw reconnect failed");
                false
            }
        }
    }
}

impl LifecycleInner {
    fn set_state(&self, state: LifecycleState) {
        _ = self.state_tx.send(state);
    }
}

#[async_trait]
impl LifecycleControl for LifecycleController {
    async fn restart_service(&self, full: bool) -> bool {
        self.restart(full).await
    }
}

/// Recover from a poisoned lock; none of the guarded values has an
/// inconsistent intermediate state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
