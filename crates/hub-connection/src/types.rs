//! Public types for the hub connection manager.

use std::fmt;
use std::time::Duration;

/// Lifecycle state of the single hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport and no scheduled attempt.
    Disconnected,
    /// Transport opening or auth handshake in progress.
    Connecting,
    /// Authenticated; requests and events flow.
    Connected,
    /// Connection lost, waiting for the next backoff attempt.
    Reconnecting,
    /// Auth rejected or circuit breaker open. Needs caller action.
    Error,
}

impl ConnectionState {
    /// Returns `true` if the manager may move from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Error)
                | (Connected, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Error)
                | (Error, Connecting)
        ) && self != next
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Authenticated against the hub.
    Connected { hub_version: Option<String> },
    /// A reconnect attempt was scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// The hub rejected the access token; no automatic retry follows.
    AuthRejected { message: String },
    /// Consecutive failures reached the threshold.
    CircuitOpened { failures: u32 },
    /// A connection succeeded after the breaker had tripped.
    CircuitClosed,
    /// The transport was lost and `resubscribe_on_reconnect` is off, so
    /// `count` local subscriptions were dropped. Their handles report
    /// inactive and the callbacks must be registered again.
    SubscriptionsDropped { count: usize },
}
