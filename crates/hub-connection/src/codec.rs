//! Frame encoding and correlation id assignment.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::warn;

use homelink_protocol::{MAX_MESSAGE_SIZE, ProtocolError, Request, WireMessage};

/// Serializes outbound frames, parses inbound ones and hands out ids.
///
/// Ids start at 1 and only ever grow for the lifetime of the codec, so an
/// id is never reused across reconnects.
#[derive(Debug)]
pub struct MessageCodec {
    next_id: AtomicU64,
    max_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    /// Codec that drops inbound frames larger than `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            max_size,
        }
    }

    /// Returns the next correlation id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn encode(&self, msg: &WireMessage) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }

    /// Assigns an id to `request` and encodes it.
    pub fn encode_request(&self, request: Request) -> Result<(u64, String), ProtocolError> {
        let id = self.next_id();
        let text = self.encode(&request.into_message(id))?;
        Ok((id, text))
    }

    /// Decodes a text frame. The hub may coalesce several messages into one
    /// JSON array; they are returned in wire order. A malformed element is
    /// logged and skipped so the rest of the batch still gets through, while
    /// a frame that is not valid JSON at all is an error.
    pub fn decode(&self, text: &str) -> Result<Vec<WireMessage>, ProtocolError> {
        if text.len() > self.max_size {
            return Err(ProtocolError::Oversized {
                size: text.len(),
                limit: self.max_size,
            });
        }
        if text.trim_start().starts_with('[') {
            let elements: Vec<Value> = serde_json::from_str(text)?;
            let total = elements.len();
            let messages: Vec<WireMessage> = elements
                .into_iter()
                .enumerate()
                .filter_map(|(index, element)| {
                    serde_json::from_value(element)
                        .inspect_err(|e| {
                            warn!(index, total, error = %e, "dropping malformed message in batch")
                        })
                        .ok()
                })
                .collect();
            Ok(messages)
        } else {
            Ok(vec![serde_json::from_str(text)?])
        }
    }
}
