//! Write pump: the only task that touches the sink.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::metrics::MetricsCollector;

/// Drains `write_rx` into the sink, counting text frames as sent messages.
///
/// Sends a close frame on the way out.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(msg) = msg else { break };
                let is_text = msg.is_text();
                if let Err(e) = write.send(msg).await {
                    error!("WebSocket write error: {e}");
                    break;
                }
                if is_text {
                    metrics.record_sent();
                    trace!("frame sent");
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn channel_sink(
        tx: mpsc::UnboundedSender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn counts_text_frames_and_closes_on_cancel() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::channel(16);
        let metrics = Arc::new(MetricsCollector::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(write_pump(
            channel_sink(sink_tx),
            write_rx,
            metrics.clone(),
            cancel.clone(),
        ));

        write_tx
            .send(tungstenite::Message::Text(r#"{"type":"ping","id":1}"#.to_string().into()))
            .await
            .unwrap();
        write_tx
            .send(tungstenite::Message::Pong(vec![].into()))
            .await
            .unwrap();

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Text(_))));
        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Pong(_))));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Close(_))));
        assert_eq!(metrics.snapshot().messages_sent, 1);
    }

    #[tokio::test]
    async fn stops_when_all_senders_drop() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::channel(16);
        drop(write_tx);

        write_pump(
            channel_sink(sink_tx),
            write_rx,
            Arc::new(MetricsCollector::new()),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Close(_))));
    }
}
