//! Health-check pump: periodic protocol pings with a pong deadline.
//!
//! Each successful round trip feeds the latency average. A missed pong
//! reports the transport as lost; the reconnect path counts the failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use homelink_protocol::Request;

use crate::codec::MessageCodec;
use crate::error::ConnectionError;
use crate::metrics::MetricsCollector;
use crate::pending::PendingCalls;

/// Called once when a pong misses its deadline.
pub(crate) type TimeoutCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct HealthCheck {
    pub(crate) write_tx: mpsc::Sender<tungstenite::Message>,
    pub(crate) codec: Arc<MessageCodec>,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) interval: Duration,
    pub(crate) pong_timeout: Duration,
}

impl HealthCheck {
    /// Sends one ping and waits for its pong. Returns the round-trip time.
    pub(crate) async fn ping(&self) -> Result<Duration, ConnectionError> {
        let request = Request::Ping;
        let kind = request.kind();
        let (id, text) = self.codec.encode_request(request)?;
        let rx = self.pending.register(id, kind)?;
        let _guard = self.pending.guard(id);
        let started = Instant::now();
        if self
            .write_tx
            .send(tungstenite::Message::Text(text.into()))
            .await
            .is_err()
        {
            return Err(ConnectionError::closed());
        }
        self.pending.wait(id, rx, self.pong_timeout).await?;
        Ok(started.elapsed())
    }
}

/// Pings every `check.interval` until cancelled, the session closes, or a
/// pong times out.
pub(crate) async fn health_pump(
    check: HealthCheck,
    on_timeout: TimeoutCallback,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(check.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = check.ping() => outcome,
        };

        match outcome {
            Ok(rtt) => {
                trace!(rtt_ms = rtt.as_millis() as u64, "health check ok");
                check.metrics.record_health_check(rtt);
            }
            Err(ConnectionError::MessageTimeout { id, timeout }) => {
                warn!(
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "pong not received in time, treating connection as lost"
                );
                if !cancel.is_cancelled() {
                    on_timeout();
                }
                return;
            }
            Err(e) => {
                debug!(error = %e, "health check stopped");
                return;
            }
        }
    }
}
