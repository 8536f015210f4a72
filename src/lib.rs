#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod protocol;
pub mod recovery;
pub mod services;
pub mod status;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Opaque numeric key for a monitored equipment unit.
pub type EquipmentId = u64;

/// Timestamp in milliseconds since [`std::time::UNIX_EPOCH`], as the feed
/// sends them.
pub type Timestamp = i64;

pub use crate::lifecycle::LifecycleController;
pub use crate::recovery::RecoveryOrchestrator;
pub use crate::ws::connection::ConnectionManager;
