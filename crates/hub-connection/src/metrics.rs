//! Connection metrics: message counters, error count and ping latency.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Weight of a new latency sample in the moving average.
const LATENCY_WEIGHT: f64 = 0.2;

/// Point-in-time copy of the collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMetrics {
    /// Moving average of ping → pong round trips, `None` before the first one.
    pub latency: Option<Duration>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
    /// Wall-clock time of the last successful ping/pong cycle.
    pub last_health_check: Option<DateTime<Utc>>,
    /// Backoff delays scheduled so far.
    pub reconnects: u64,
    pub last_backoff: Option<Duration>,
}

#[derive(Debug, Default)]
struct Samples {
    latency: Option<Duration>,
    last_health_check: Option<DateTime<Utc>>,
    last_backoff: Option<Duration>,
}

#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    samples: Mutex<Samples>,
}

impl MetricsCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn samples(&self) -> std::sync::MutexGuard<'_, Samples> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backoff(&self, delay: Duration) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.samples().last_backoff = Some(delay);
    }

    /// Folds a round-trip time into the latency average and stamps the
    /// health-check time.
    pub(crate) fn record_health_check(&self, rtt: Duration) {
        let mut samples = self.samples();
        samples.latency = Some(match samples.latency {
            None => rtt,
            Some(prev) => Duration::from_secs_f64(
                prev.as_secs_f64() * (1.0 - LATENCY_WEIGHT) + rtt.as_secs_f64() * LATENCY_WEIGHT,
            ),
        });
        samples.last_health_check = Some(Utc::now());
    }

    pub(crate) fn snapshot(&self) -> ConnectionMetrics {
        let samples = self.samples();
        ConnectionMetrics {
            latency: samples.latency,
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            last_health_check: samples.last_health_check,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_backoff: samples.last_backoff,
        }
    }
}
