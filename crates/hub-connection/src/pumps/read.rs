//! Read pump: decodes inbound frames and routes them.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use homelink_protocol::WireMessage;

use crate::codec::MessageCodec;
use crate::error::ConnectionError;
use crate::metrics::MetricsCollector;
use crate::pending::PendingCalls;
use crate::subscriptions::SubscriptionRegistry;

/// Called once when the stream ends on its own (not on cancellation).
pub(crate) type CloseCallback = Box<dyn FnOnce() + Send>;

/// Everything an inbound frame can be routed to.
#[derive(Clone)]
pub(crate) struct Inbound {
    pub(crate) codec: Arc<MessageCodec>,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) subscriptions: Arc<SubscriptionRegistry>,
    pub(crate) metrics: Arc<MetricsCollector>,
}

impl Inbound {
    /// Decodes a text frame and dispatches each message it carries, in order.
    pub(crate) fn handle_text(&self, text: &str) {
        let messages = match self.codec.decode(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("dropping inbound frame: {e}");
                return;
            }
        };
        for msg in messages {
            self.metrics.record_received();
            self.route(msg);
        }
    }

    fn route(&self, msg: WireMessage) {
        match msg {
            WireMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or_default())
                } else {
                    let (code, message) = error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("unknown_error".into(), "request failed".into()));
                    Err(ConnectionError::Hub { code, message })
                };
                if !self.pending.resolve(id, outcome) {
                    debug!(id, "result for unknown or expired call");
                }
            }
            WireMessage::Pong { id } => {
                if !self.pending.resolve(id, Ok(serde_json::Value::Null)) {
                    trace!(id, "late pong");
                }
            }
            WireMessage::Event { id, event } => {
                let delivered = self.subscriptions.dispatch(id, &event);
                trace!(id, event_type = %event.event_type, delivered, "event");
            }
            WireMessage::Unknown => {
                debug!("ignoring frame of unknown type");
            }
            other => {
                debug!(kind = ?other.kind(), "unexpected frame after handshake");
            }
        }
    }
}

/// Reads from the stream until it ends, errors, or `cancel` fires.
///
/// Answers transport-level pings through `write_tx`. `on_close` runs only
/// when the hub side went away.
pub(crate) async fn read_pump<S>(
    mut read: S,
    inbound: Inbound,
    write_tx: mpsc::Sender<tungstenite::Message>,
    on_close: CloseCallback,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => inbound.handle_text(&text),
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        trace!("received ping, sending pong");
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        debug!(frame = ?frame, "received close frame");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if !cancel.is_cancelled() {
        on_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use homelink_protocol::{HubEvent, MessageKind};
    use serde_json::json;

    use crate::subscriptions::Listener;

    fn inbound() -> Inbound {
        Inbound {
            codec: Arc::new(MessageCodec::new()),
            pending: Arc::new(PendingCalls::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    #[tokio::test]
    async fn result_resolves_pending_call() {
        let inbound = inbound();
        let rx = inbound.pending.register(7, MessageKind::GetConfig).unwrap();

        inbound.handle_text(r#"{"id":7,"type":"result","success":true,"result":{"version":"1"}}"#);

        assert_eq!(rx.await.unwrap().unwrap(), json!({"version": "1"}));
        assert_eq!(inbound.pending.len(), 0);
        assert_eq!(inbound.metrics.snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn failed_result_becomes_hub_error() {
        let inbound = inbound();
        let rx = inbound.pending.register(3, MessageKind::CallService).unwrap();

        inbound.handle_text(
            r#"{"id":3,"type":"result","success":false,"error":{"code":"not_found","message":"Service not found."}}"#,
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::Hub { ref code, .. } if code == "not_found"));
    }

    #[tokio::test]
    async fn batched_frame_routes_every_message() {
        let inbound = inbound();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        inbound.subscriptions.add(
            "state_changed",
            Listener::Sync(Arc::new(move |ev: HubEvent| {
                sink.lock().unwrap().push(ev.data["n"].as_u64().unwrap());
            })),
        );
        let rx = inbound.pending.register(9, MessageKind::Ping).unwrap();

        inbound.handle_text(
            r#"[
                {"id":1,"type":"event","event":{"event_type":"state_changed","data":{"n":1}}},
                {"id":9,"type":"pong"},
                {"id":1,"type":"event","event":{"event_type":"state_changed","data":{"n":2}}}
            ]"#,
        );

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(inbound.metrics.snapshot().messages_received, 3);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_ignored() {
        let inbound = inbound();
        inbound.handle_text("not valid json {{{");
        inbound.handle_text(r#"{"type":"some_future_kind","id":4}"#);
        assert_eq!(inbound.metrics.snapshot().messages_received, 1);
    }

    #[tokio::test]
    async fn fires_on_close_when_stream_ends() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = closed.clone();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(
            empty,
            inbound(),
            write_tx,
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
            CancellationToken::new(),
        )
        .await;

        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancellation_suppresses_on_close() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = closed.clone();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        read_pump(
            stream::pending::<Result<tungstenite::Message, tungstenite::Error>>(),
            inbound(),
            write_tx,
            Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
            cancel,
        )
        .await;

        assert!(!closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn answers_transport_pings() {
        let (write_tx, mut write_rx) = mpsc::channel(16);
        let frames = stream::iter(vec![Ok::<_, tungstenite::Error>(
            tungstenite::Message::Ping(vec![1, 2].into()),
        )]);

        read_pump(frames, inbound(), write_tx, Box::new(|| {}), CancellationToken::new()).await;

        assert!(matches!(write_rx.recv().await, Some(tungstenite::Message::Pong(_))));
    }
}
