use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum accepted inbound frame size in bytes (16 MB).
///
/// A full `get_states` result on a large installation runs to a few MB;
/// anything above this is treated as garbage and dropped.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Correlation id used by frames that do not answer a request.
pub const RESERVED_ID: u64 = 0;

/// Base reconnect backoff.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);

/// Consecutive failures before the circuit breaker opens.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Per-call response deadline.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Upper bound for a single backoff delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Exponential growth of the backoff delay per attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Upper bound of the random fraction added on top of a backoff delay.
pub const DEFAULT_JITTER: f64 = 0.25;

/// Deadline for opening the transport and completing the auth handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the health check pings the hub.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long a health-check ping may wait for its pong.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire message kind, serialized as the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // Handshake
    AuthRequired,
    Auth,
    AuthOk,
    AuthInvalid,

    // Requests from the client
    SubscribeEvents,
    UnsubscribeEvents,
    CallService,
    GetStates,
    GetConfig,
    Ping,

    // Frames from the hub
    Pong,
    Result,
    Event,
}

impl MessageKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequired => "auth_required",
            Self::Auth => "auth",
            Self::AuthOk => "auth_ok",
            Self::AuthInvalid => "auth_invalid",
            Self::SubscribeEvents => "subscribe_events",
            Self::UnsubscribeEvents => "unsubscribe_events",
            Self::CallService => "call_service",
            Self::GetStates => "get_states",
            Self::GetConfig => "get_config",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Result => "result",
            Self::Event => "event",
        }
    }

    /// Returns `true` for kinds that expect a correlated answer.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::SubscribeEvents
                | Self::UnsubscribeEvents
                | Self::CallService
                | Self::GetStates
                | Self::GetConfig
                | Self::Ping
        )
    }

    /// Returns `true` for the four kinds exchanged before the connection is usable.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::AuthRequired | Self::Auth | Self::AuthOk | Self::AuthInvalid
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
