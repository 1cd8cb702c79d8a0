//! Connection manager: one hub connection and everything hanging off it.
//!
//! All state transitions go through a single mutex-protected [`Machine`].
//! Every connect or disconnect starts a new generation; background tasks
//! (timers, pumps, attempts) carry the generation they were started for
//! and turn into no-ops once it is stale, so a `disconnect()` can never be
//! undone by a timer that was already firing.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use homelink_protocol::{EntityState, HubConfig, HubEvent, Request, ServiceCall};

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::codec::MessageCodec;
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::handshake::{self, Authenticated};
use crate::metrics::{ConnectionMetrics, MetricsCollector};
use crate::middleware::{MiddlewareChain, ServiceMiddleware, TimingMiddleware, ValidateServiceCall};
use crate::pending::PendingCalls;
use crate::pumps::read::Inbound;
use crate::reconnection;
use crate::session::{LostCallback, Session};
use crate::subscriptions::{
    AsyncEventCallback, Listener, Subscription, SubscriptionRegistry, validate_event_type,
};
use crate::transport::{Connector, Transport, WsConnector};
use crate::types::{ConnectionEvent, ConnectionState};

/// Capacity of the [`ConnectionEvent`] queue.
const EVENT_QUEUE: usize = 64;

/// Mutable connection state, guarded by one lock.
pub(crate) struct Machine {
    pub(crate) state: ConnectionState,
    pub(crate) config: Option<Arc<ConnectionConfig>>,
    pub(crate) breaker: CircuitBreaker,
    /// Backoff attempt index, reset on every successful connect.
    pub(crate) attempt: u32,
    pub(crate) generation: u64,
    /// Parent of every token handed out during the current generation.
    pub(crate) epoch: CancellationToken,
    /// Pending backoff or cool-down timer.
    pub(crate) timer: Option<CancellationToken>,
    pub(crate) session: Option<Session>,
    pub(crate) hub_version: Option<String>,
}

/// State shared between the manager handle and its background tasks.
pub(crate) struct Shared {
    connector: Arc<dyn Connector>,
    pub(crate) codec: Arc<MessageCodec>,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) subscriptions: Arc<SubscriptionRegistry>,
    pub(crate) metrics: Arc<MetricsCollector>,
    middleware: MiddlewareChain,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    shutdown: CancellationToken,
}

impl Shared {
    fn new(connector: Arc<dyn Connector>, middleware: MiddlewareChain) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let shutdown = CancellationToken::new();
        Self {
            connector,
            codec: Arc::new(MessageCodec::new()),
            pending: Arc::new(PendingCalls::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            middleware,
            machine: Mutex::new(Machine {
                state: ConnectionState::Disconnected,
                config: None,
                breaker: CircuitBreaker::new(1, None),
                attempt: 0,
                generation: 0,
                epoch: shutdown.child_token(),
                timer: None,
                session: None,
                hub_version: None,
            }),
            state_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        }
    }

    pub(crate) fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        self.machine().state
    }

    /// Moves the machine to `next` and notifies observers.
    pub(crate) fn set_state(&self, m: &mut Machine, next: ConnectionState) {
        let prev = m.state;
        if prev == next {
            return;
        }
        debug_assert!(
            prev.can_transition_to(next),
            "illegal transition {prev} -> {next}"
        );
        m.state = next;
        info!(from = %prev, to = %next, "connection state changed");
        self.state_tx.send_replace(next);
        self.emit(ConnectionEvent::StateChanged(next));
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("connection event dropped: {e}");
        }
    }

    /// Starts a new generation, cancelling every task of the previous one.
    fn new_epoch(&self, m: &mut Machine) {
        m.generation = m.generation.wrapping_add(1);
        m.epoch.cancel();
        m.epoch = self.shutdown.child_token();
        m.timer = None;
        if let Some(session) = m.session.take() {
            session.shutdown();
        }
        m.hub_version = None;
    }

    fn inbound(&self) -> Inbound {
        Inbound {
            codec: self.codec.clone(),
            pending: self.pending.clone(),
            subscriptions: self.subscriptions.clone(),
            metrics: self.metrics.clone(),
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        let m = self.machine();
        m.generation == generation && m.state == ConnectionState::Connected
    }

    /// Sends `request` on the live session and waits for its result.
    async fn request(&self, request: Request) -> Result<(u64, Value), ConnectionError> {
        let kind = request.kind();
        let (id, text, rx, write_tx, timeout) = {
            let m = self.machine();
            let (ConnectionState::Connected, Some(session), Some(config)) =
                (m.state, m.session.as_ref(), m.config.as_ref())
            else {
                if m.breaker.state() == CircuitState::Open {
                    return Err(ConnectionError::CircuitOpen);
                }
                return Err(ConnectionError::NotConnected);
            };
            let (id, text) = self.codec.encode_request(request)?;
            // Registered under the machine lock so a concurrent teardown
            // either sees this call or the call sees no session.
            let rx = self.pending.register(id, kind)?;
            (id, text, rx, session.sender(), config.message_timeout)
        };
        let _guard = self.pending.guard(id);

        trace!(id, %kind, "sending request");
        if write_tx
            .send(tungstenite::Message::Text(text.into()))
            .await
            .is_err()
        {
            return Err(ConnectionError::closed());
        }
        let value = self.pending.wait(id, rx, timeout).await?;
        Ok((id, value))
    }

    /// [`Shared::request`] that counts failures.
    async fn invoke(&self, request: Request) -> Result<(u64, Value), ConnectionError> {
        let outcome = self.request(request).await;
        if let Err(e) = &outcome {
            self.metrics.record_error();
            debug!(error = %e, "request failed");
        }
        outcome
    }

    fn release_subscription(self: &Arc<Self>, key: u64) {
        let Some(removed) = self.subscriptions.remove(key) else {
            return;
        };
        if !removed.last_for_type {
            return;
        }
        if let Some(hub_id) = removed.hub_id {
            debug!(event_type = %removed.event_type, hub_id, "last listener gone, unsubscribing on hub");
            self.unsubscribe_on_hub(hub_id);
        }
    }

    /// Cancels a hub subscription in the background.
    fn unsubscribe_on_hub(self: &Arc<Self>, hub_id: u64) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            let request = Request::UnsubscribeEvents {
                subscription: hub_id,
            };
            if let Err(e) = shared.invoke(request).await {
                debug!(hub_id, error = %e, "unsubscribe_events failed");
            }
        });
    }
}

/// Runs one connection attempt for `generation`.
///
/// The machine must already be in `Connecting`. Failures are handed to the
/// reconnection logic before being returned. Returns a boxed future to
/// break the type cycle with the reconnect timers, which spawn this.
pub(crate) fn attempt_connect(
    shared: Arc<Shared>,
    generation: u64,
) -> BoxFuture<'static, Result<(), ConnectionError>> {
    Box::pin(async move {
        let (config, epoch) = {
            let m = shared.machine();
            match &m.config {
                Some(config)
                    if m.generation == generation && m.state == ConnectionState::Connecting =>
                {
                    (config.clone(), m.epoch.clone())
                }
                _ => return Err(ConnectionError::closed()),
            }
        };
        info!(url = %config.url, "connecting to hub");

        let opened = tokio::select! {
            _ = epoch.cancelled() => return Err(ConnectionError::closed()),
            opened = tokio::time::timeout(config.handshake_timeout, open(&shared, &config)) => opened,
        };
        let outcome = opened
            .unwrap_or_else(|_| Err(ConnectionError::HandshakeTimeout(config.handshake_timeout)));

        match outcome {
            Ok((transport, auth)) => establish(&shared, generation, transport, auth, &config),
            Err(ConnectionError::Auth(message)) => {
                auth_rejected(&shared, generation, &message);
                Err(ConnectionError::Auth(message))
            }
            Err(e) => {
                reconnection::handle_failure(&shared, generation, &e);
                Err(e)
            }
        }
    })
}

/// Opens the transport and authenticates.
async fn open(
    shared: &Shared,
    config: &ConnectionConfig,
) -> Result<(Transport, Authenticated), ConnectionError> {
    let mut transport = shared.connector.connect(&config.url).await?;
    let auth =
        handshake::authenticate(&mut transport, &config.token, &shared.codec, &shared.metrics)
            .await?;
    Ok((transport, auth))
}

/// Installs the session for an authenticated transport.
fn establish(
    shared: &Arc<Shared>,
    generation: u64,
    transport: Transport,
    auth: Authenticated,
    config: &ConnectionConfig,
) -> Result<(), ConnectionError> {
    let mut m = shared.machine();
    if m.generation != generation || m.state != ConnectionState::Connecting {
        debug!("connection attempt superseded, dropping transport");
        return Err(ConnectionError::closed());
    }

    let on_lost: LostCallback = {
        let weak = Arc::downgrade(shared);
        Arc::new(move |reason: &'static str| {
            if let Some(shared) = weak.upgrade() {
                reconnection::on_transport_lost(&shared, generation, reason);
            }
        })
    };
    let session = Session::start(
        transport,
        shared.inbound(),
        config,
        on_lost,
        m.epoch.child_token(),
    );
    m.session = Some(session);
    m.hub_version = auth.hub_version.clone();
    m.attempt = 0;
    let recovered = m.breaker.record_success();
    shared.set_state(&mut m, ConnectionState::Connected);
    shared.emit(ConnectionEvent::Connected {
        hub_version: auth.hub_version.clone(),
    });
    if recovered {
        info!("circuit breaker closed");
        shared.emit(ConnectionEvent::CircuitClosed);
    }
    drop(m);

    info!(url = %config.url, hub_version = ?auth.hub_version, "connected to hub");
    tokio::spawn(sync_subscriptions(shared.clone(), generation));
    Ok(())
}

fn auth_rejected(shared: &Arc<Shared>, generation: u64, message: &str) {
    let mut m = shared.machine();
    if m.generation != generation {
        return;
    }
    shared.metrics.record_error();
    shared.set_state(&mut m, ConnectionState::Error);
    shared.emit(ConnectionEvent::AuthRejected {
        message: message.to_string(),
    });
}

/// Sends `subscribe_events` for every event type that has local listeners
/// but no hub subscription yet.
async fn sync_subscriptions(shared: Arc<Shared>, generation: u64) {
    for event_type in shared.subscriptions.unsynced_types() {
        if !shared.is_live(generation) {
            return;
        }
        let request = Request::SubscribeEvents {
            event_type: Some(event_type.clone()),
        };
        match shared.invoke(request).await {
            Ok((hub_id, _)) => {
                if shared.subscriptions.set_hub_id(&event_type, hub_id) {
                    debug!(event_type = %event_type, hub_id, "subscribed on hub");
                } else {
                    shared.unsubscribe_on_hub(hub_id);
                }
            }
            Err(e) => warn!(event_type = %event_type, error = %e, "failed to subscribe on hub"),
        }
    }
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    connector: Option<Arc<dyn Connector>>,
    middleware: Vec<Arc<dyn ServiceMiddleware>>,
    default_middleware: bool,
}

impl ConnectionManagerBuilder {
    /// Replaces the default WebSocket connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Appends a service-call middleware.
    pub fn middleware(mut self, layer: Arc<dyn ServiceMiddleware>) -> Self {
        self.middleware.push(layer);
        self
    }

    /// Drops the built-in validation and timing middlewares.
    pub fn without_default_middleware(mut self) -> Self {
        self.default_middleware = false;
        self
    }

    pub fn build(self) -> ConnectionManager {
        let mut chain = MiddlewareChain::default();
        if self.default_middleware {
            chain.push(Arc::new(ValidateServiceCall));
            chain.push(Arc::new(TimingMiddleware::default()));
        }
        for layer in self.middleware {
            chain.push(layer);
        }
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new()));
        debug!(middleware = chain.len(), "connection manager created");
        ConnectionManager {
            shared: Arc::new(Shared::new(connector, chain)),
        }
    }
}

/// Manages the connection to one hub.
///
/// Construct once, `connect`, use, `disconnect`. Dropping the manager
/// cancels every task it started.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    /// Creates a manager with the WebSocket connector and default middleware.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            connector: None,
            middleware: Vec::new(),
            default_middleware: true,
        }
    }

    /// Connects and authenticates.
    ///
    /// A no-op returning `Ok` while already connecting or connected.
    /// Otherwise resolves with the outcome of the first attempt: a
    /// retryable failure is returned with a backoff reconnect already
    /// scheduled, an auth rejection leaves the manager in `Error`.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectionError> {
        config.validate()?;
        let generation = {
            let mut m = self.shared.machine();
            if matches!(
                m.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!(state = %m.state, "connect ignored, connection already active");
                return Ok(());
            }
            self.shared.new_epoch(&mut m);
            m.breaker = CircuitBreaker::new(config.max_retries, config.circuit_cooldown);
            m.attempt = 0;
            m.config = Some(Arc::new(config));
            self.shared.set_state(&mut m, ConnectionState::Connecting);
            m.generation
        };

        // Spawned so a caller dropping this future cannot strand the
        // machine in `Connecting`.
        match tokio::spawn(attempt_connect(self.shared.clone(), generation)).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ConnectionError::Connection(format!(
                "connection task failed: {e}"
            ))),
        }
    }

    /// Closes the connection, cancels every timer and fails every pending call.
    ///
    /// Subscriptions are dropped. Always succeeds.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        let mut m = shared.machine();
        shared.new_epoch(&mut m);
        let failed = shared.pending.fail_all(ConnectionError::closed);
        shared.subscriptions.clear();
        if m.state != ConnectionState::Disconnected {
            shared.set_state(&mut m, ConnectionState::Disconnected);
            info!(failed_calls = failed, "disconnected from hub");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that always holds the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.metrics.snapshot()
    }

    pub fn circuit_state(&self) -> CircuitSnapshot {
        self.shared.machine().breaker.snapshot()
    }

    /// Hub version reported by the last successful handshake.
    pub fn hub_version(&self) -> Option<String> {
        self.shared.machine().hub_version.clone()
    }

    /// Number of requests awaiting a result.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Number of live local subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Number of live local subscriptions for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.shared.subscriptions.subscriber_count(event_type)
    }

    /// Closes the circuit breaker and zeroes the failure count.
    ///
    /// Cancels a pending backoff timer. If the manager is waiting to
    /// reconnect, or parked in `Error` by an open breaker, a new attempt
    /// starts immediately.
    ///
    /// The retry needs a Tokio runtime. Called from outside one, the breaker
    /// is still reset but the state is left alone: a pending backoff timer
    /// keeps running, and a manager parked in `Error` waits for `connect()`.
    pub fn reset_circuit_breaker(&self) {
        let shared = &self.shared;
        let runtime = tokio::runtime::Handle::try_current().ok();
        let (runtime, generation) = {
            let mut m = shared.machine();
            let was_tripped = m.breaker.state() != CircuitState::Closed;
            m.breaker.reset();
            m.attempt = 0;
            if was_tripped {
                info!("circuit breaker reset");
                shared.emit(ConnectionEvent::CircuitClosed);
            }
            let retry = m.config.is_some()
                && match m.state {
                    ConnectionState::Reconnecting => true,
                    ConnectionState::Error => was_tripped,
                    _ => false,
                };
            if !retry {
                reconnection::cancel_timer(&mut m);
                return;
            }
            let Some(runtime) = runtime else {
                warn!(state = %m.state, "no runtime to reconnect on, retry skipped");
                return;
            };
            reconnection::cancel_timer(&mut m);
            shared.set_state(&mut m, ConnectionState::Connecting);
            (runtime, m.generation)
        };
        runtime.spawn(attempt_connect(shared.clone(), generation));
    }

    /// Calls `callback` for every hub event of `event_type`.
    ///
    /// The first local subscription for a type subscribes on the hub; when
    /// not connected this happens once the connection is established.
    pub async fn subscribe<F>(
        &self,
        event_type: &str,
        callback: F,
    ) -> Result<Subscription, ConnectionError>
    where
        F: Fn(HubEvent) + Send + Sync + 'static,
    {
        self.add_subscription(event_type, Listener::Sync(Arc::new(callback)))
            .await
    }

    /// Like [`subscribe`](Self::subscribe) for async callbacks. Each
    /// invocation is spawned, so a slow callback never holds up dispatch.
    pub async fn subscribe_async<F, Fut>(
        &self,
        event_type: &str,
        callback: F,
    ) -> Result<Subscription, ConnectionError>
    where
        F: Fn(HubEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: AsyncEventCallback =
            Arc::new(move |event: HubEvent| -> BoxFuture<'static, ()> {
                Box::pin(callback(event))
            });
        self.add_subscription(event_type, Listener::Async(callback))
            .await
    }

    async fn add_subscription(
        &self,
        event_type: &str,
        listener: Listener,
    ) -> Result<Subscription, ConnectionError> {
        validate_event_type(event_type)?;
        let shared = &self.shared;
        let (key, first) = shared.subscriptions.add(event_type, listener);

        if first && shared.state() == ConnectionState::Connected {
            let request = Request::SubscribeEvents {
                event_type: Some(event_type.to_string()),
            };
            match shared.invoke(request).await {
                Ok((hub_id, _)) => {
                    if !shared.subscriptions.set_hub_id(event_type, hub_id) {
                        shared.unsubscribe_on_hub(hub_id);
                    }
                }
                Err(e) => {
                    shared.subscriptions.remove(key);
                    return Err(e);
                }
            }
        }

        let weak = Arc::downgrade(shared);
        Ok(Subscription::new(
            key,
            event_type.to_string(),
            Arc::downgrade(&shared.subscriptions),
            Box::new(move |key: u64| {
                if let Some(shared) = weak.upgrade() {
                    shared.release_subscription(key);
                }
            }),
        ))
    }

    /// Invokes a hub service through the middleware chain.
    pub async fn call_service(&self, call: ServiceCall) -> Result<Value, ConnectionError> {
        let shared = self.shared.clone();
        self.shared
            .middleware
            .run(call, |call| async move {
                shared
                    .invoke(Request::CallService(call))
                    .await
                    .map(|(_, value)| value)
            })
            .await
    }

    /// Sends an arbitrary request and returns the raw result.
    pub async fn send_request(&self, request: Request) -> Result<Value, ConnectionError> {
        self.shared
            .invoke(request)
            .await
            .map(|(_, value)| value)
    }

    /// Fetches every entity state.
    pub async fn get_states(&self) -> Result<Vec<EntityState>, ConnectionError> {
        let value = self.send_request(Request::GetStates).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetches the hub configuration.
    pub async fn get_config(&self) -> Result<HubConfig, ConnectionError> {
        let value = self.send_request(Request::GetConfig).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
        self.shared.shutdown.cancel();
    }
}
