//! Callback surface of the connection layer.

use crate::EquipmentId;
use crate::protocol::response::StatusUpdate;

/// Capability interface the composing application implements to observe the
/// connection.
///
/// Every method has a no-op default, so implementors override only what they
/// care about; [`NoopObserver`] is the documented null implementation for
/// wiring a connection nobody observes. Callbacks are invoked from the
/// connection's own task and must not block.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// The transport opened and the subscription set has been replayed.
    fn on_connected(&self) {}

    /// The transport closed, either deliberately or unexpectedly.
    fn on_disconnected(&self) {}

    /// An automatic reconnection attempt is about to run.
    fn on_reconnecting(&self, attempt: u32, max_attempts: u32) {
        let _ = (attempt, max_attempts);
    }

    /// A transport or server error surfaced; the connection state is
    /// unaffected unless a close follows.
    fn on_error(&self, message: &str) {
        let _ = message;
    }

    /// A status update arrived for an equipment unit that translated into the
    /// internal identifier space.
    fn on_status_update(&self, equipment_id: EquipmentId, update: &StatusUpdate) {
        let _ = (equipment_id, update);
    }
}

/// Observer that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}
