//! Wire protocol for the hub event connection.
//!
//! Frames are JSON objects tagged by `type`. Everything after the auth
//! handshake carries a numeric `id` that correlates a request with its
//! `result` (or `pong`), and subscription events reuse the id of the
//! `subscribe_events` request that created them.

pub mod constants;
pub mod messages;
pub mod types;

pub use constants::{MAX_MESSAGE_SIZE, MessageKind, RESERVED_ID};
pub use messages::{Request, WireMessage};
pub use types::{
    EntityState, HubConfig, HubEvent, ResultError, STATE_CHANGED, ServiceCall, StateChangedData,
};

/// Errors produced while decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
}
