use serde::Serialize;

use crate::EquipmentId;

/// Command sent by the client over the status feed.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Request live updates for the given equipment units.
    Subscribe { equipment_ids: Vec<EquipmentId> },
    /// Stop live updates for the given equipment units.
    Unsubscribe { equipment_ids: Vec<EquipmentId> },
    /// Liveness probe; the server answers with a `pong` event.
    Ping,
    /// One-shot status query for the given equipment units.
    GetStatus { equipment_ids: Vec<EquipmentId> },
}

impl ClientCommand {
    /// Create a subscribe command.
    #[must_use]
    pub fn subscribe(equipment_ids: Vec<EquipmentId>) -> Self {
        Self::Subscribe { equipment_ids }
    }

    /// Create an unsubscribe command.
    #[must_use]
    pub fn unsubscribe(equipment_ids: Vec<EquipmentId>) -> Self {
        Self::Unsubscribe { equipment_ids }
    }

    /// Create a liveness probe.
    #[must_use]
    pub const fn ping() -> Self {
        Self::Ping
    }

    /// Create a one-shot status query.
    #[must_use]
    pub fn get_status(equipment_ids: Vec<EquipmentId>) -> Self {
        Self::GetStatus { equipment_ids }
    }
}
