//! Cache of the most recently observed status per equipment unit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::Display;

use crate::EquipmentId;
use crate::protocol::response::StatusUpdate;
use crate::services::BaselineRecord;

/// Normalized equipment status.
///
/// The feed sends free-form status strings; anything that does not map onto
/// a known value becomes [`Unknown`](Self::Unknown) rather than an error.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EquipmentStatus {
    Running,
    Idle,
    Warning,
    Fault,
    Offline,
    Unknown,
}

impl EquipmentStatus {
    /// Normalize a raw status string from the feed.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" | "run" | "active" | "online" => Self::Running,
            "idle" | "standby" | "stopped" => Self::Idle,
            "warning" | "degraded" | "alarm" => Self::Warning,
            "fault" | "error" | "failed" | "faulted" => Self::Fault,
            "offline" | "disconnected" | "unreachable" => Self::Offline,
            _ => Self::Unknown,
        }
    }
}

/// One cached observation. Last write wins; entries are never deleted except
/// on explicit unmapping of the equipment unit.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize)]
pub struct StatusCacheEntry {
    pub equipment_id: EquipmentId,
    /// Normalized form of `raw_status`
    pub status: EquipmentStatus,
    pub raw_status: String,
    pub observed_at: DateTime<Utc>,
    /// Fields the feed sent beyond the documented shape
    pub extra: Map<String, Value>,
}

/// One entry per known equipment unit, created on first observation and
/// overwritten on every later one.
#[derive(Debug, Default)]
pub struct StatusCache {
    entries: DashMap<EquipmentId, StatusCacheEntry>,
}

impl StatusCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live observation for `equipment_id`, stamped now.
    pub fn apply(&self, equipment_id: EquipmentId, update: &StatusUpdate) {
        self.entries.insert(
            equipment_id,
            StatusCacheEntry {
                equipment_id,
                status: EquipmentStatus::normalize(&update.status),
                raw_status: update.status.clone(),
                observed_at: Utc::now(),
                extra: update.extra.clone(),
            },
        );
    }

    /// Record a baseline observation, keeping its own timestamp when the
    /// source provides one.
    pub fn apply_baseline(&self, record: &BaselineRecord) {
        self.entries.insert(
            record.equipment_id,
            StatusCacheEntry {
                equipment_id: record.equipment_id,
                status: EquipmentStatus::normalize(&record.status),
                raw_status: record.status.clone(),
                observed_at: record.observed_at.unwrap_or_else(Utc::now),
                extra: record.extra.clone(),
            },
        );
    }

    #[must_use]
    pub fn get(&self, equipment_id: EquipmentId) -> Option<StatusCacheEntry> {
        self.entries
            .get(&equipment_id)
            .map(|entry| entry.value().clone())
    }

    /// Drop the entry for an equipment unit that was explicitly unmapped.
    pub fn remove(&self, equipment_id: EquipmentId) -> Option<StatusCacheEntry> {
        self.entries.remove(&equipment_id).map(|(_, entry)| entry)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every cached entry, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StatusCacheEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Equipment units with no observed update within the threshold window.
    #[must_use]
    pub fn stale_entities(&self, threshold: Duration) -> Vec<EquipmentId> {
        let Ok(window) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - window;
        self.entries
            .iter()
            .filter(|entry| entry.observed_at < cutoff)
            .map(|entry| entry.equipment_id)
            .collect()
    }

    /// Remove every stale entry; returns how many were dropped.
    pub fn purge_stale(&self, threshold: Duration) -> usize {
        let stale = self.stale_entities(threshold);
        for id in &stale {
            self.entries.remove(id);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn update(status: &str) -> StatusUpdate {
        let payload = json!({
            "type": "equipment_status",
            "equipment_id": 1,
            "status": status,
            "load_pct": 85
        });
        match crate::protocol::decode(payload.to_string().as_bytes())
            .unwrap()
            .unwrap()
        {
            crate::protocol::ServerEvent::EquipmentStatus(update) => update,
            other => panic!("expected equipment_status, got {other:?}"),
        }
    }

    #[test]
    fn normalization_table() {
        assert_eq!(EquipmentStatus::normalize("RUNNING"), EquipmentStatus::Running);
        assert_eq!(EquipmentStatus::normalize("standby"), EquipmentStatus::Idle);
        assert_eq!(EquipmentStatus::normalize("Alarm"), EquipmentStatus::Warning);
        assert_eq!(EquipmentStatus::normalize("FAULTED"), EquipmentStatus::Fault);
        assert_eq!(EquipmentStatus::normalize("offline"), EquipmentStatus::Offline);
        assert_eq!(EquipmentStatus::normalize("???"), EquipmentStatus::Unknown);
    }

    #[test]
    fn apply_is_last_write_wins() {
        let cache = StatusCache::new();

        cache.apply(7, &update("running"));
        cache.apply(7, &update("fault"));

        let entry = cache.get(7).expect("entry missing");
        assert_eq!(entry.status, EquipmentStatus::Fault);
        assert_eq!(entry.raw_status, "fault");
        assert_eq!(entry.extra.get("load_pct"), Some(&json!(85)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_is_explicit_only() {
        let cache = StatusCache::new();
        cache.apply(3, &update("idle"));

        assert!(cache.remove(3).is_some());
        assert!(cache.get(3).is_none());
        assert!(cache.remove(3).is_none());
    }

    #[test]
    fn stale_entities_respect_threshold() {
        let cache = StatusCache::new();
        cache.apply_baseline(&BaselineRecord {
            equipment_id: 1,
            status: "running".to_owned(),
            observed_at: Some(Utc::now() - chrono::Duration::hours(48)),
            extra: Map::new(),
        });
        cache.apply(2, &update("running"));

        let stale = cache.stale_entities(Duration::from_secs(24 * 3600));
        assert_eq!(stale, vec![1]);

        assert_eq!(cache.purge_stale(Duration::from_secs(24 * 3600)), 1);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
    }
}
