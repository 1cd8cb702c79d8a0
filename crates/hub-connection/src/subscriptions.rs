//! Local event subscriptions and their fan-out.
//!
//! Several callbacks may listen to the same event type; the hub only needs
//! one `subscribe_events` per type, so the registry also remembers the hub
//! subscription id for every type that has been sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use homelink_protocol::{HubEvent, RESERVED_ID};

use crate::error::ConnectionError;

/// Synchronous event callback.
pub type EventCallback = Arc<dyn Fn(HubEvent) + Send + Sync>;

/// Event callback returning a future; each invocation is spawned.
pub type AsyncEventCallback = Arc<dyn Fn(HubEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Listener {
    Sync(EventCallback),
    Async(AsyncEventCallback),
}

struct Entry {
    key: u64,
    event_type: String,
    listener: Listener,
}

#[derive(Default)]
struct RegistryInner {
    next_key: u64,
    /// Registration order is dispatch order.
    entries: Vec<Entry>,
    /// Hub subscription id per event type, once `subscribe_events` succeeded.
    hub_ids: HashMap<String, u64>,
}

/// What [`SubscriptionRegistry::remove`] took away.
#[derive(Debug, PartialEq)]
pub(crate) struct Removed {
    pub(crate) event_type: String,
    /// `true` when no local listener for the type is left.
    pub(crate) last_for_type: bool,
    /// Hub subscription to cancel, only set together with `last_for_type`.
    pub(crate) hub_id: Option<u64>,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a listener. Returns its key and whether it is the first one for
    /// `event_type`.
    pub(crate) fn add(&self, event_type: &str, listener: Listener) -> (u64, bool) {
        let mut inner = self.inner();
        let first = !inner.entries.iter().any(|e| e.event_type == event_type);
        inner.next_key += 1;
        let key = inner.next_key;
        inner.entries.push(Entry {
            key,
            event_type: event_type.to_string(),
            listener,
        });
        debug!(key, event_type, first, "added subscription");
        (key, first)
    }

    /// Removes a listener. Idempotent: unknown keys return `None`.
    pub(crate) fn remove(&self, key: u64) -> Option<Removed> {
        let mut inner = self.inner();
        let pos = inner.entries.iter().position(|e| e.key == key)?;
        let entry = inner.entries.remove(pos);
        let last_for_type = !inner
            .entries
            .iter()
            .any(|e| e.event_type == entry.event_type);
        let hub_id = if last_for_type {
            inner.hub_ids.remove(&entry.event_type)
        } else {
            None
        };
        debug!(key, event_type = %entry.event_type, last_for_type, "removed subscription");
        Some(Removed {
            event_type: entry.event_type,
            last_for_type,
            hub_id,
        })
    }

    /// Records the hub subscription for `event_type`.
    ///
    /// Returns `false` (and records nothing) if every local listener for the
    /// type went away while the request was in flight, or if another hub
    /// subscription for the type was recorded first. The caller owns the
    /// cleanup of a rejected id.
    pub(crate) fn set_hub_id(&self, event_type: &str, hub_id: u64) -> bool {
        let mut inner = self.inner();
        if !inner.entries.iter().any(|e| e.event_type == event_type)
            || inner.hub_ids.contains_key(event_type)
        {
            return false;
        }
        inner.hub_ids.insert(event_type.to_string(), hub_id);
        true
    }

    #[cfg(test)]
    pub(crate) fn hub_id(&self, event_type: &str) -> Option<u64> {
        self.inner().hub_ids.get(event_type).copied()
    }

    /// Event types with listeners but no hub subscription, in registration order.
    pub(crate) fn unsynced_types(&self) -> Vec<String> {
        let inner = self.inner();
        let mut types: Vec<String> = Vec::new();
        for entry in &inner.entries {
            if !inner.hub_ids.contains_key(&entry.event_type) && !types.contains(&entry.event_type)
            {
                types.push(entry.event_type.clone());
            }
        }
        types
    }

    /// Forgets hub subscription ids; they die with the transport.
    pub(crate) fn forget_hub_ids(&self) {
        self.inner().hub_ids.clear();
    }

    /// Drops every listener and hub id. Returns how many listeners went.
    pub(crate) fn clear(&self) -> usize {
        let mut inner = self.inner();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.hub_ids.clear();
        dropped
    }

    pub(crate) fn contains(&self, key: u64) -> bool {
        self.inner().entries.iter().any(|e| e.key == key)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub(crate) fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner()
            .entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Invokes every listener for `event.event_type` in registration order.
    ///
    /// Listeners are collected first and called without the registry lock,
    /// so a callback may subscribe or unsubscribe. Async listeners are
    /// spawned and not awaited. Returns the number of listeners invoked.
    ///
    /// `subscription` is the hub subscription id the event arrived on; events
    /// from a hub subscription other than the recorded one are dropped.
    pub(crate) fn dispatch(&self, subscription: u64, event: &HubEvent) -> usize {
        let listeners: Vec<Listener> = {
            let inner = self.inner();
            if let Some(&hub_id) = inner.hub_ids.get(&event.event_type)
                && subscription != RESERVED_ID
                && subscription != hub_id
            {
                trace!(subscription, hub_id, "event from a stale hub subscription");
                return 0;
            }
            inner
                .entries
                .iter()
                .filter(|e| e.event_type == event.event_type)
                .map(|e| e.listener.clone())
                .collect()
        };

        if listeners.is_empty() {
            trace!(event_type = %event.event_type, "no subscriber for event, dropping");
            return 0;
        }

        for listener in &listeners {
            match listener {
                Listener::Sync(cb) => cb(event.clone()),
                Listener::Async(cb) => {
                    tokio::spawn(cb(event.clone()));
                }
            }
        }
        listeners.len()
    }
}

/// Checks that `event_type` is a non-empty identifier.
pub(crate) fn validate_event_type(event_type: &str) -> Result<(), ConnectionError> {
    let valid = !event_type.is_empty()
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConnectionError::InvalidEventType(event_type.to_string()))
    }
}

/// Handle returned by `subscribe`. Call [`Subscription::unsubscribe`] to stop
/// receiving events; dropping the handle keeps the subscription alive.
pub struct Subscription {
    key: u64,
    event_type: String,
    done: AtomicBool,
    registry: Weak<SubscriptionRegistry>,
    release: Box<dyn Fn(u64) + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        key: u64,
        event_type: String,
        registry: Weak<SubscriptionRegistry>,
        release: Box<dyn Fn(u64) + Send + Sync>,
    ) -> Self {
        Self {
            key,
            event_type,
            done: AtomicBool::new(false),
            registry,
            release,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Stops delivery to this callback. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.release)(self.key);
        }
    }

    /// `true` while the callback can still receive events.
    ///
    /// Turns `false` after [`unsubscribe`](Self::unsubscribe), and also when
    /// the manager dropped the subscription itself: on `disconnect()`, or on
    /// an automatic reconnect without `resubscribe_on_reconnect`.
    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
            && self
                .registry
                .upgrade()
                .is_some_and(|registry| registry.contains(self.key))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("event_type", &self.event_type)
            .field("active", &self.is_active())
            .finish()
    }
}
