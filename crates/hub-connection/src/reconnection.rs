//! Reconnection with exponential backoff, gated by the circuit breaker.
//!
//! Every failed attempt and every transport loss funnels through
//! [`handle_failure`], which either schedules the next attempt after a
//! backoff delay or opens the breaker and parks the manager in `Error`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::manager::{Machine, Shared, attempt_connect};
use crate::types::{ConnectionEvent, ConnectionState};

/// Exponential backoff with additive jitter.
///
/// The delay for 0-indexed attempt `n` is drawn from
/// `[base * factor^n, base * factor^n * (1 + jitter)]` and capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            base: config.reconnect_interval,
            max: config.max_reconnect_delay,
            factor: config.backoff_factor,
            jitter: config.jitter,
        }
    }

    /// Delay before jitter, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Delay for `attempt` with a fresh random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let r: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with(attempt, r)
    }

    /// Delay for `attempt` with the jitter fraction `r` in `[0, 1]`.
    pub(crate) fn delay_with(&self, attempt: u32, r: f64) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let jittered = base * (1.0 + r.clamp(0.0, 1.0) * self.jitter);
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }
}

/// Records a failed attempt (or a lost transport) and decides what happens next.
///
/// Stale generations are ignored so a `disconnect()` or fresh `connect()`
/// always wins over failures reported by tasks it already cancelled.
pub(crate) fn handle_failure(shared: &Arc<Shared>, generation: u64, err: &ConnectionError) {
    let mut m = shared.machine();
    if m.generation != generation {
        debug!(error = %err, "ignoring failure from a stale connection attempt");
        return;
    }
    shared.metrics.record_error();

    let Some(config) = m.config.clone() else {
        return;
    };

    let opened = m.breaker.record_failure(tokio::time::Instant::now());
    if opened || m.breaker.state() == CircuitState::Open {
        let failures = m.breaker.failures();
        warn!(
            failures,
            max_retries = config.max_retries,
            error = %err,
            "circuit breaker opened, automatic reconnects suppressed"
        );
        shared.set_state(&mut m, ConnectionState::Error);
        shared.emit(ConnectionEvent::CircuitOpened { failures });
        if let Some(cooldown) = m.breaker.cooldown() {
            schedule_probe(shared, &mut m, cooldown);
        }
        return;
    }

    let policy = BackoffPolicy::from_config(&config);
    let delay = policy.delay_for_attempt(m.attempt);
    m.attempt = m.attempt.saturating_add(1);
    let attempt = m.attempt;
    shared.metrics.record_backoff(delay);

    warn!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "connection attempt failed, backing off"
    );
    if m.state != ConnectionState::Reconnecting {
        shared.set_state(&mut m, ConnectionState::Reconnecting);
    }
    shared.emit(ConnectionEvent::Reconnecting { attempt, delay });
    schedule_attempt(shared, &mut m, delay);
}

/// Tears down a live session after the transport closed or a pong was missed.
pub(crate) fn on_transport_lost(shared: &Arc<Shared>, generation: u64, reason: &str) {
    {
        let mut m = shared.machine();
        if m.generation != generation || m.state != ConnectionState::Connected {
            return;
        }
        if let Some(session) = m.session.take() {
            session.shutdown();
        }
        m.hub_version = None;
        let failed = shared.pending.fail_all(ConnectionError::closed);
        let resubscribe = m
            .config
            .as_ref()
            .is_some_and(|c| c.resubscribe_on_reconnect);
        let dropped = if resubscribe {
            shared.subscriptions.forget_hub_ids();
            0
        } else {
            shared.subscriptions.clear()
        };
        warn!(reason, failed_calls = failed, resubscribe, "connection lost");
        if dropped > 0 {
            warn!(count = dropped, "subscriptions dropped with the connection");
            shared.emit(ConnectionEvent::SubscriptionsDropped { count: dropped });
        }
        shared.set_state(&mut m, ConnectionState::Reconnecting);
    }
    handle_failure(shared, generation, &ConnectionError::Connection(reason.to_string()));
}

/// Cancels a pending backoff or cool-down timer, if any.
pub(crate) fn cancel_timer(m: &mut Machine) {
    if let Some(token) = m.timer.take() {
        token.cancel();
    }
}

/// Arms the backoff timer. When it fires the manager moves to `Connecting`
/// and runs one attempt.
fn schedule_attempt(shared: &Arc<Shared>, m: &mut Machine, delay: Duration) {
    cancel_timer(m);
    let token = m.epoch.child_token();
    m.timer = Some(token.clone());
    let generation = m.generation;
    let shared = shared.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("reconnect timer cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if !fire(&shared, generation, &token, ConnectionState::Reconnecting) {
            return;
        }
        let _ = attempt_connect(shared, generation).await;
    });
}

/// Arms the cool-down timer of an open breaker. When it fires the breaker
/// goes half-open and a single probe attempt runs.
fn schedule_probe(shared: &Arc<Shared>, m: &mut Machine, cooldown: Duration) {
    cancel_timer(m);
    let token = m.epoch.child_token();
    m.timer = Some(token.clone());
    let generation = m.generation;
    let shared = shared.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(cooldown) => {}
        }
        if !fire(&shared, generation, &token, ConnectionState::Error) {
            return;
        }
        info!("circuit breaker half-open, probing hub");
        let _ = attempt_connect(shared, generation).await;
    });
}

/// Claims a fired timer. Returns `false` if the timer was cancelled or the
/// manager moved on while it slept.
fn fire(
    shared: &Arc<Shared>,
    generation: u64,
    token: &CancellationToken,
    expected: ConnectionState,
) -> bool {
    let mut m = shared.machine();
    if token.is_cancelled() || m.generation != generation || m.state != expected {
        return false;
    }
    if !m.breaker.allows_attempt(tokio::time::Instant::now()) {
        debug!("circuit breaker still open, attempt skipped");
        return false;
    }
    m.timer = None;
    shared.set_state(&mut m, ConnectionState::Connecting);
    true
}
