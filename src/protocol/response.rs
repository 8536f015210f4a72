use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{EquipmentId, Result, Timestamp};

/// Event received from the status feed.
///
/// Dispatched on the `type` tag. Unknown tags are filtered out by [`decode`]
/// before deserialization so new server-side event types never break the
/// message loop.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgment carrying the server version.
    Connected(ConnectedAck),
    /// Acknowledgment of a subscribe command.
    Subscribed(SubscribedAck),
    /// Acknowledgment of an unsubscribe command.
    Unsubscribed(UnsubscribedAck),
    /// Live status update for one equipment unit.
    EquipmentStatus(StatusUpdate),
    /// Answer to a liveness probe.
    Pong(PongAck),
    /// Server-side error report.
    Error(ServerError),
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectedAck {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct SubscribedAck {
    pub equipment_ids: Vec<EquipmentId>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct UnsubscribedAck {
    pub equipment_ids: Vec<EquipmentId>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Raw status update as it arrives on the wire.
///
/// `equipment_id` is the feed's external identifier; translation into the
/// internal identifier space happens at the connection boundary. Fields the
/// feed sends beyond the documented shape are preserved in `extra`.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct StatusUpdate {
    pub equipment_id: EquipmentId,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct PongAck {
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct ServerError {
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
}

/// Event types this client understands.
const KNOWN_TYPES: [&str; 6] = [
    "connected",
    "subscribed",
    "unsubscribed",
    "equipment_status",
    "pong",
    "error",
];

/// Peek at the `type` tag without deserializing the full payload.
#[derive(Deserialize)]
struct TypePeek {
    #[serde(default)]
    r#type: Option<String>,
}

/// Decode a single server event.
///
/// Returns `Ok(None)` for messages whose `type` tag is not one this client
/// understands; those are discarded without affecting the message loop. A
/// payload that is not valid JSON, lacks the tag, or fails to match its
/// documented shape is an error the caller logs and drops.
pub fn decode(bytes: &[u8]) -> Result<Option<ServerEvent>> {
    let peek: TypePeek = serde_json::from_slice(bytes)?;
    let Some(tag) = peek.r#type else {
        return Err(crate::error::Error::protocol("message is missing the type tag"));
    };
    if !KNOWN_TYPES.contains(&tag.as_str()) {
        return Ok(None);
    }

    let mut event: ServerEvent = serde_json::from_slice(bytes)?;
    if let ServerEvent::EquipmentStatus(update) = &mut event {
        // The flatten map would otherwise retain the dispatch tag.
        update.extra.remove("type");
    }
    Ok(Some(event))
}
