//! One authenticated transport and the tasks that drive it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::pumps::health::{HealthCheck, health_pump};
use crate::pumps::read::{Inbound, read_pump};
use crate::pumps::write::write_pump;
use crate::transport::Transport;

/// Capacity of the outbound frame queue.
const WRITE_QUEUE: usize = 256;

/// Reports a lost transport with a short reason.
pub(crate) type LostCallback = Arc<dyn Fn(&'static str) + Send + Sync>;

/// A live session: read, write and health-check pumps over one transport.
///
/// Dropping the session stops its pumps; the write pump still gets to send
/// a close frame.
pub(crate) struct Session {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    health_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
}

impl Session {
    /// Spawns the pumps. `on_lost` fires at most once, and never after
    /// `cancel` has been triggered.
    pub(crate) fn start(
        transport: Transport,
        inbound: Inbound,
        config: &ConnectionConfig,
        on_lost: LostCallback,
        cancel: CancellationToken,
    ) -> Self {
        let Transport { sink, stream } = transport;
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_QUEUE);

        let write_handle = tokio::spawn(write_pump(
            sink,
            write_rx,
            inbound.metrics.clone(),
            cancel.clone(),
        ));

        let health_handle = {
            let check = HealthCheck {
                write_tx: write_tx.clone(),
                codec: inbound.codec.clone(),
                pending: inbound.pending.clone(),
                metrics: inbound.metrics.clone(),
                interval: config.health_check_interval,
                pong_timeout: config.pong_timeout,
            };
            let on_lost = on_lost.clone();
            tokio::spawn(health_pump(
                check,
                Box::new(move || on_lost("pong timeout")),
                cancel.clone(),
            ))
        };

        let read_handle = tokio::spawn(read_pump(
            stream,
            inbound,
            write_tx.clone(),
            Box::new(move || on_lost("transport closed")),
            cancel.clone(),
        ));

        Self {
            write_tx,
            cancel,
            read_handle,
            health_handle,
            _write_handle: write_handle,
        }
    }

    /// Queue for outbound frames.
    pub(crate) fn sender(&self) -> mpsc::Sender<tungstenite::Message> {
        self.write_tx.clone()
    }

    /// Stops the pumps. The write pump closes the transport on its way out.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.health_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::{SinkExt, sink, stream};

    use crate::codec::MessageCodec;
    use crate::metrics::MetricsCollector;
    use crate::pending::PendingCalls;
    use crate::subscriptions::SubscriptionRegistry;

    fn inbound() -> Inbound {
        Inbound {
            codec: Arc::new(MessageCodec::new()),
            pending: Arc::new(PendingCalls::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("ws://hub.local/api/websocket", "token")
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_sink_and_shutdown_closes() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<tungstenite::Message>();
        let sink = sink::unfold(sink_tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        });
        let transport = Transport::new(
            sink,
            stream::pending::<Result<tungstenite::Message, tungstenite::Error>>(),
        );
        let lost = Arc::new(Mutex::new(Vec::new()));
        let seen = lost.clone();

        let session = Session::start(
            transport,
            inbound(),
            &config(),
            Arc::new(move |reason: &'static str| seen.lock().unwrap().push(reason)),
            CancellationToken::new(),
        );

        session
            .sender()
            .send(tungstenite::Message::Text("{}".to_string().into()))
            .await
            .unwrap();
        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Text(_))));

        session.shutdown();
        let close = tokio::time::timeout(Duration::from_secs(2), sink_rx.recv())
            .await
            .unwrap();
        assert!(matches!(close, Some(tungstenite::Message::Close(_))));
        assert!(lost.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hub_closing_reports_loss() {
        let sink = sink::drain::<tungstenite::Message>()
            .sink_map_err(|_| tungstenite::Error::ConnectionClosed);
        let transport = Transport::new(
            sink,
            stream::iter(vec![Ok::<_, tungstenite::Error>(tungstenite::Message::Close(
                None,
            ))]),
        );
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();

        let _session = Session::start(
            transport,
            inbound(),
            &config(),
            Arc::new(move |reason: &'static str| {
                let _ = lost_tx.send(reason);
            }),
            CancellationToken::new(),
        );

        let reason = tokio::time::timeout(Duration::from_secs(2), lost_rx.recv())
            .await
            .unwrap();
        assert_eq!(reason, Some("transport closed"));
    }
}
