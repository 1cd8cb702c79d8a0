//! Outstanding requests awaiting a `result` or `pong`.
//!
//! Removal from the table is the single arbitration point between a
//! result arriving and the call's deadline expiring: whichever side removes
//! the entry first owns the outcome, the other side becomes a no-op.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use homelink_protocol::MessageKind;

use crate::error::ConnectionError;

/// Outcome delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Value, ConnectionError>;

struct PendingCall {
    kind: MessageKind,
    sent_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// Table of in-flight requests keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<u64, PendingCall>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a call. Fails if `id` already has a live entry.
    pub(crate) fn register(
        &self,
        id: u64,
        kind: MessageKind,
    ) -> Result<oneshot::Receiver<CallOutcome>, ConnectionError> {
        let mut calls = self.calls();
        if calls.contains_key(&id) {
            return Err(ConnectionError::Connection(format!(
                "correlation id {id} is already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        calls.insert(
            id,
            PendingCall {
                kind,
                sent_at: Instant::now(),
                tx,
            },
        );
        Ok(rx)
    }

    /// Delivers `outcome` to the caller waiting on `id`.
    ///
    /// Returns `false` if no such call is live (already timed out, failed,
    /// or never registered).
    pub(crate) fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let Some(call) = self.calls().remove(&id) else {
            trace!(id, "no pending call for result");
            return false;
        };
        trace!(
            id,
            kind = %call.kind,
            elapsed_ms = call.sent_at.elapsed().as_millis() as u64,
            "resolved pending call"
        );
        let _ = call.tx.send(outcome);
        true
    }

    /// Removes `id` without notifying the waiter.
    pub(crate) fn remove(&self, id: u64) -> bool {
        self.calls().remove(&id).is_some()
    }

    /// Ties the entry for `id` to the caller's future: dropping the guard
    /// removes the entry, so a caller that is cancelled mid-flight does not
    /// leave it behind. Ids are never reused, so removal after the call
    /// completed is a no-op.
    pub(crate) fn guard(&self, id: u64) -> PendingGuard<'_> {
        PendingGuard { table: self, id }
    }

    /// Fails every live call with the error built by `err`.
    pub(crate) fn fail_all(&self, err: impl Fn() -> ConnectionError) -> usize {
        let drained: Vec<(u64, PendingCall)> = self.calls().drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            debug!(id, kind = %call.kind, "failing pending call");
            let _ = call.tx.send(Err(err()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.calls().contains_key(&id)
    }

    /// Waits for the outcome of `id`, enforcing `timeout`.
    ///
    /// Exactly one of the result path and the timeout path wins; a result
    /// that lands while the timeout is being processed is still returned.
    pub(crate) async fn wait(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<CallOutcome>,
        timeout: Duration,
    ) -> CallOutcome {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConnectionError::closed()),
            Err(_) => {
                if self.remove(id) {
                    Err(ConnectionError::MessageTimeout { id, timeout })
                } else {
                    rx.try_recv().unwrap_or_else(|_| Err(ConnectionError::closed()))
                }
            }
        }
    }
}

/// Removes its call from the table when dropped. See [`PendingCalls::guard`].
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.remove(self.id) {
            debug!(id = self.id, "caller went away, dropped pending call");
        }
    }
}
