#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;

use crate::EquipmentId;

/// The set of equipment identifiers the client wants live updates for.
///
/// The set survives reconnects: after any successful (re)connect the wire is
/// asked to subscribe to exactly this set, with no duplicates and no
/// omissions. A mere disconnect never shrinks it; only [`clear`] on full
/// teardown does.
///
/// The resend flag records mutations made while disconnected that still need
/// flushing. It is cleared by an explicit disconnect (the set itself stays)
/// and by the flush that follows a successful connect.
///
/// [`clear`]: SubscriptionTracker::clear
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    ids: DashSet<EquipmentId>,
    dirty: AtomicBool,
}

impl SubscriptionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single identifier; returns whether it was newly tracked.
    pub fn add(&self, id: EquipmentId) -> bool {
        self.ids.insert(id)
    }

    /// Add identifiers, returning those not previously tracked.
    pub fn add_many(&self, ids: &[EquipmentId]) -> Vec<EquipmentId> {
        ids.iter().copied().filter(|id| self.ids.insert(*id)).collect()
    }

    /// Remove identifiers, returning those that were actually tracked.
    pub fn remove_many(&self, ids: &[EquipmentId]) -> Vec<EquipmentId> {
        ids.iter()
            .copied()
            .filter(|id| self.ids.remove(id).is_some())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: EquipmentId) -> bool {
        self.ids.contains(&id)
    }

    /// Sorted copy of the current set.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EquipmentId> {
        let mut ids: Vec<EquipmentId> = self.ids.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop every tracked identifier. Full teardown only; a disconnect never
    /// calls this.
    pub fn clear(&self) {
        self.ids.clear();
        self.dirty.store(false, Ordering::Release);
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Whether mutations made while disconnected still await a flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Compare a subscribe acknowledgment against the tracked set.
    pub(crate) fn reconcile_subscribed(&self, acked: &[EquipmentId]) {
        for id in acked {
            if !self.ids.contains(id) {
                tracing::debug!(
                    equipment_id = *id,
                    "server acknowledged a subscription this client does not track"
                );
            }
        }
    }

    /// Compare an unsubscribe acknowledgment against the tracked set.
    pub(crate) fn reconcile_unsubscribed(&self, acked: &[EquipmentId]) {
        for id in acked {
            if self.ids.contains(id) {
                tracing::debug!(
                    equipment_id = *id,
                    "server dropped a subscription this client still tracks"
                );
            }
        }
    }
}
