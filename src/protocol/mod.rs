//! Wire protocol for the status feed.
//!
//! The feed speaks JSON-tagged messages over a persistent duplex stream:
//! client commands carry an `action` tag, server events a `type` tag. The
//! codec is stateless; connection concerns live in [`crate::ws`].

pub mod request;
pub mod response;

pub use request::ClientCommand;
pub use response::{ServerEvent, decode};

use crate::Result;

/// Encode a client command into its wire representation.
pub fn encode(command: &ClientCommand) -> Result<String> {
    Ok(serde_json::to_string(command)?)
}
