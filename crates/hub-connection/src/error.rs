//! Error taxonomy for the connection manager.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use homelink_protocol::ProtocolError;

/// Errors surfaced by the connection manager and its calls.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("message {id} timed out after {timeout:?}")]
    MessageTimeout { id: u64, timeout: Duration },

    #[error("circuit breaker is open, reconnection suppressed")]
    CircuitOpen,

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("hub error {code}: {message}")]
    Hub { code: String, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("invalid event type: {0:?}")]
    InvalidEventType(String),

    #[error("invalid service call: {0}")]
    InvalidServiceCall(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Error used to fail in-flight calls when the transport goes away.
    pub(crate) fn closed() -> Self {
        Self::Connection("connection closed".into())
    }

    /// Returns `true` when the backoff controller should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::HandshakeTimeout(_)
                | Self::Ws(_)
                | Self::Protocol(_)
                | Self::Json(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            ConnectionError::closed().to_string(),
            "connection error: connection closed"
        );
        assert_eq!(
            ConnectionError::Auth("bad token".into()).to_string(),
            "authentication rejected: bad token"
        );
        let err = ConnectionError::MessageTimeout {
            id: 4,
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "message 4 timed out after 10s");
        let err = ConnectionError::Hub {
            code: "not_found".into(),
            message: "Service not found.".into(),
        };
        assert!(err.to_string().contains("not_found"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ConnectionError::closed().is_retryable());
        assert!(ConnectionError::HandshakeTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!ConnectionError::Auth("nope".into()).is_retryable());
        assert!(!ConnectionError::CircuitOpen.is_retryable());
        assert!(
            !ConnectionError::MessageTimeout {
                id: 1,
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );
    }
}
