//! Capability interfaces of the collaborators this crate is composed with.
//!
//! Collaborators are injected at construction and either fully implement
//! their interface or are represented by the documented null implementation;
//! they are never probed for ad hoc. None of these types is a process-wide
//! singleton; tests instantiate isolated instances freely.

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::notify::{AlertSink, EventBus, NullAlertSink, NullBus};
use crate::ws::traits::{ConnectionObserver, NoopObserver};
use crate::{EquipmentId, Result};

/// Translates the feed's external equipment identifiers into the internal
/// identifier space. Updates whose identifier does not translate are dropped
/// silently.
pub trait IdentifierMap: Send + Sync + 'static {
    fn translate(&self, external: EquipmentId) -> Option<EquipmentId>;
}

/// Uses feed identifiers unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughIdentifiers;

impl IdentifierMap for PassthroughIdentifiers {
    fn translate(&self, external: EquipmentId) -> Option<EquipmentId> {
        Some(external)
    }
}

/// One equipment record from the baseline/initial-state source.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct BaselineRecord {
    pub equipment_id: EquipmentId,
    /// Raw status string, normalized by the cache on insertion
    #[builder(into)]
    pub status: String,
    /// When the source observed this status; `None` means "now"
    pub observed_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub extra: Map<String, Value>,
}

/// Result of one baseline load.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Builder)]
pub struct BaselineSnapshot {
    #[builder(default)]
    pub entities: Vec<BaselineRecord>,
    #[builder(into)]
    pub summary: Option<String>,
}

/// Source of the baseline state loaded during startup.
#[async_trait]
pub trait BaselineLoader: Send + Sync {
    /// Load the baseline, considering entities stale beyond `threshold_hours`.
    async fn load(&self, threshold_hours: u32) -> Result<BaselineSnapshot>;

    /// Dedicated reconnect used by connection-layer-only restarts. The
    /// default reports the capability as unsupported.
    async fn reconnect(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Loader for deployments without a baseline source; always returns an empty
/// snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBaseline;

#[async_trait]
impl BaselineLoader for EmptyBaseline {
    async fn load(&self, _threshold_hours: u32) -> Result<BaselineSnapshot> {
        Ok(BaselineSnapshot::default())
    }
}

/// Alternate data-synchronization path tried first by connection-layer-only
/// restarts.
#[async_trait]
pub trait AlternateSync: Send + Sync {
    /// Attempt to resynchronize; `Ok(true)` means the path recovered the
    /// connection layer.
    async fn resync(&self) -> Result<bool>;
}

/// Statically resolved alternate-sync strategy, selected at construction.
/// Absence is a variant, never a caught exception or a probed option.
#[non_exhaustive]
#[derive(Clone, Default)]
pub enum SyncStrategy {
    /// No alternate path is configured for this deployment.
    #[default]
    Unavailable,
    /// A fully initialized alternate path.
    Alternate(Arc<dyn AlternateSync>),
}

/// Visual/state overlay collaborator reset during startup and shutdown.
pub trait Presenter: Send + Sync {
    fn reset_overlays(&self) {}
}

/// Presenter for headless deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {}

/// Connection-layer handle recovery action handlers call back through.
#[async_trait]
pub trait ConnectionControl: Send + Sync {
    /// Open the connection if it is not already open.
    async fn ensure_connected(&self) -> Result<bool>;

    /// Tear the connection down.
    async fn shutdown(&self);

    /// Re-send the full subscription set; returns how many identifiers were
    /// replayed.
    fn replay_subscriptions(&self) -> Result<usize>;

    /// Whether the transport is currently connected.
    fn is_online(&self) -> bool;
}

/// Connection handle for contexts with no connection wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullConnectionControl;

#[async_trait]
impl ConnectionControl for NullConnectionControl {
    async fn ensure_connected(&self) -> Result<bool> {
        Ok(false)
    }

    async fn shutdown(&self) {}

    fn replay_subscriptions(&self) -> Result<usize> {
        Ok(0)
    }

    fn is_online(&self) -> bool {
        false
    }
}

/// Lifecycle handle recovery action handlers call back through.
#[async_trait]
pub trait LifecycleControl: Send + Sync {
    /// Full or connection-layer-only restart; returns whether the service is
    /// running afterwards.
    async fn restart_service(&self, full: bool) -> bool;
}

/// Lifecycle handle for contexts with no lifecycle wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLifecycleControl;

#[async_trait]
impl LifecycleControl for NullLifecycleControl {
    async fn restart_service(&self, _full: bool) -> bool {
        false
    }
}

/// The full collaborator surface the lifecycle controller is composed with.
///
/// Defaults to null implementations throughout; override the pieces a
/// deployment actually has:
///
/// ```ignore
/// let collaborators = Collaborators::default()
///     .with_loader(Arc::new(RestBaselineLoader::new(api)))
///     .with_bus(Arc::new(app_bus));
/// ```
#[non_exhaustive]
#[derive(Clone)]
pub struct Collaborators {
    pub translator: Arc<dyn IdentifierMap>,
    pub observer: Arc<dyn ConnectionObserver>,
    pub loader: Arc<dyn BaselineLoader>,
    /// Fallback path taken automatically when `loader` fails during startup.
    pub legacy_loader: Arc<dyn BaselineLoader>,
    pub sync_strategy: SyncStrategy,
    pub presenter: Arc<dyn Presenter>,
    pub bus: Arc<dyn EventBus>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            translator: Arc::new(PassthroughIdentifiers),
            observer: Arc::new(NoopObserver),
            loader: Arc::new(EmptyBaseline),
            legacy_loader: Arc::new(EmptyBaseline),
            sync_strategy: SyncStrategy::Unavailable,
            presenter: Arc::new(NullPresenter),
            bus: Arc::new(NullBus),
            alerts: Arc::new(NullAlertSink),
        }
    }
}

impl Collaborators {
    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn IdentifierMap>) -> Self {
        self.translator = translator;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn BaselineLoader>) -> Self {
        self.loader = loader;
        self
    }

    #[must_use]
    pub fn with_legacy_loader(mut self, loader: Arc<dyn BaselineLoader>) -> Self {
        self.legacy_loader = loader;
        self
    }

    #[must_use]
    pub fn with_sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.sync_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_presenter(mut self, presenter: Arc<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }
}
