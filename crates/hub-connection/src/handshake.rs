//! Auth handshake run on a freshly opened transport.
//!
//! `auth_required` → `auth { access_token }` → `auth_ok` | `auth_invalid`.
//! Each step blocks the next; the caller bounds the whole exchange with the
//! handshake timeout.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::{debug, trace, warn};

use homelink_protocol::WireMessage;

use crate::codec::MessageCodec;
use crate::error::ConnectionError;
use crate::metrics::MetricsCollector;
use crate::transport::Transport;

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Authenticated {
    pub(crate) hub_version: Option<String>,
}

/// Authenticates `transport` with `token`.
///
/// Returns [`ConnectionError::Auth`] on `auth_invalid`, which callers must not retry.
pub(crate) async fn authenticate(
    transport: &mut Transport,
    token: &str,
    codec: &MessageCodec,
    metrics: &MetricsCollector,
) -> Result<Authenticated, ConnectionError> {
    match next_message(transport, codec, metrics).await? {
        WireMessage::AuthRequired { ha_version } => {
            debug!(hub_version = ?ha_version, "hub requested authentication");
        }
        other => {
            return Err(unexpected("auth_required", &other));
        }
    }

    let auth = codec.encode(&WireMessage::Auth {
        access_token: token.to_string(),
    })?;
    transport.sink.send(tungstenite::Message::Text(auth.into())).await?;
    metrics.record_sent();

    match next_message(transport, codec, metrics).await? {
        WireMessage::AuthOk { ha_version } => Ok(Authenticated {
            hub_version: ha_version,
        }),
        WireMessage::AuthInvalid { message } => {
            let message = message.unwrap_or_else(|| "invalid access token".into());
            warn!(reason = %message, "hub rejected access token");
            Err(ConnectionError::Auth(message))
        }
        other => Err(unexpected("auth_ok or auth_invalid", &other)),
    }
}

fn unexpected(expected: &str, got: &WireMessage) -> ConnectionError {
    let got = got.kind().map_or("unknown", |k| k.as_str());
    ConnectionError::Connection(format!("handshake expected {expected}, got {got}"))
}

/// Reads the next protocol message, skipping control frames.
async fn next_message(
    transport: &mut Transport,
    codec: &MessageCodec,
    metrics: &MetricsCollector,
) -> Result<WireMessage, ConnectionError> {
    loop {
        match transport.stream.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => {
                let mut messages = codec.decode(&text)?.into_iter();
                let Some(first) = messages.next() else {
                    continue;
                };
                metrics.record_received();
                trace!(kind = ?first.kind(), "handshake frame");
                return Ok(first);
            }
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                return Err(ConnectionError::Connection(
                    "hub closed the connection during handshake".into(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
