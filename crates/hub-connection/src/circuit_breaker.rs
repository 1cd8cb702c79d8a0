//! Circuit breaker guarding automatic reconnects.
//!
//! Closed lets attempts through. After `threshold` consecutive failures the
//! breaker opens and attempts are suppressed. With a cool-down configured,
//! an open breaker turns half-open once the cool-down has elapsed and lets
//! a single probe through; the probe's outcome closes or re-opens it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of the breaker handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    state: CircuitState,
    failures: u32,
    threshold: u32,
    cooldown: Option<Duration>,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Option<Duration>) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
            last_failure: None,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn cooldown(&self) -> Option<Duration> {
        self.cooldown
    }

    pub(crate) fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.failures,
            last_failure: self.last_failure,
        }
    }

    /// Returns `true` if an attempt may proceed now.
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open here.
    pub(crate) fn allows_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = match (self.cooldown, self.opened_at) {
                    (Some(cooldown), Some(opened_at)) => now.duration_since(opened_at) >= cooldown,
                    _ => false,
                };
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                }
                elapsed
            }
        }
    }

    /// Records a successful connection. Returns `true` if the breaker was
    /// not closed before.
    pub(crate) fn record_success(&mut self) -> bool {
        let was_tripped = self.state != CircuitState::Closed;
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.opened_at = None;
        was_tripped
    }

    /// Records a failed attempt. Returns `true` if this failure opened the breaker.
    pub(crate) fn record_failure(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Utc::now());
        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failures >= self.threshold,
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
        trip
    }

    /// Forces the breaker closed with a zero failure count.
    pub(crate) fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.opened_at = None;
    }
}
