//! In-memory hub used by the integration tests.
//!
//! [`FakeConnector`] hands the manager a transport backed by channels and
//! runs a small hub behind it: the auth handshake, pong replies and
//! subscribe/unsubscribe bookkeeping are automatic, every other request is
//! forwarded to the test through [`FakeHub::next_request`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{sink, stream};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};

use homelink_connection::{
    ConnectFuture, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState, Connector,
    Transport,
};
use homelink_protocol::WireMessage;

pub const TOKEN: &str = "secret-token";
pub const HUB_VERSION: &str = "2024.6.1";
pub const URL: &str = "ws://hub.test:8123/api/websocket";

/// Generous virtual-time bound for anything a test waits on.
const WAIT: Duration = Duration::from_secs(600);

/// What the connector does on one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Refuse,
    /// Never completes; only the handshake timeout gets the manager out.
    Stall,
    Accept,
}

pub struct FakeConnector {
    plan: Mutex<VecDeque<Plan>>,
    fallback: Mutex<Plan>,
    attempts: AtomicUsize,
    token: String,
    hubs_tx: mpsc::UnboundedSender<FakeHub>,
    hubs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeHub>>,
}

impl FakeConnector {
    /// Follows `plan` attempt by attempt, then `fallback` forever.
    pub fn new(plan: impl IntoIterator<Item = Plan>, fallback: Plan) -> Arc<Self> {
        let (hubs_tx, hubs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            plan: Mutex::new(plan.into_iter().collect()),
            fallback: Mutex::new(fallback),
            attempts: AtomicUsize::new(0),
            token: TOKEN.to_string(),
            hubs_tx,
            hubs_rx: tokio::sync::Mutex::new(hubs_rx),
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::new([], Plan::Accept)
    }

    pub fn set_fallback(&self, plan: Plan) {
        *self.fallback.lock().unwrap() = plan;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Waits for the hub behind the next accepted connection.
    pub async fn next_hub(&self) -> FakeHub {
        let mut rx = self.hubs_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("no connection accepted in time")
            .expect("connector dropped")
    }

    fn accept(&self) -> Transport {
        let (to_hub_tx, to_hub_rx) = mpsc::unbounded_channel::<Message>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<Message>();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let state = Arc::new(HubState {
            answer_pings: AtomicBool::new(true),
            frames: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        });

        tokio::spawn(drive(
            to_hub_rx,
            to_client_tx.clone(),
            requests_tx,
            state.clone(),
            self.token.clone(),
        ));
        let _ = self.hubs_tx.send(FakeHub {
            to_client: to_client_tx,
            requests: requests_rx,
            state: state.clone(),
        });

        let sink = sink::unfold((to_hub_tx, state), |(tx, state), msg: Message| async move {
            if msg.is_text() {
                state.frames.fetch_add(1, Ordering::SeqCst);
            }
            tx.send(msg)
                .map_err(|_| tungstenite::Error::ConnectionClosed)?;
            Ok::<_, tungstenite::Error>((tx, state))
        });
        let stream = stream::unfold(to_client_rx, |mut rx| async move {
            let msg = rx.recv().await?;
            Some((Ok::<_, tungstenite::Error>(msg), rx))
        });
        Transport::new(sink, stream)
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, _url: &'a str) -> ConnectFuture<'a> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| *self.fallback.lock().unwrap());
        Box::pin(async move {
            match step {
                Plan::Refuse => Err(ConnectionError::Connection("connection refused".into())),
                Plan::Stall => std::future::pending().await,
                Plan::Accept => Ok(self.accept()),
            }
        })
    }
}

struct HubState {
    answer_pings: AtomicBool,
    /// Text frames the client wrote, handshake included.
    frames: AtomicUsize,
    pings: AtomicUsize,
    subscribed: Mutex<Vec<(u64, String)>>,
    unsubscribed: Mutex<Vec<u64>>,
}

/// Test-side handle to one accepted connection.
pub struct FakeHub {
    to_client: mpsc::UnboundedSender<Message>,
    requests: mpsc::UnboundedReceiver<WireMessage>,
    state: Arc<HubState>,
}

impl FakeHub {
    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Message::Text(value.to_string().into()));
    }

    pub fn reply(&self, id: u64, result: Value) {
        self.send_json(json!({"type": "result", "id": id, "success": true, "result": result}));
    }

    pub fn fail(&self, id: u64, code: &str, message: &str) {
        self.send_json(json!({
            "type": "result",
            "id": id,
            "success": false,
            "error": {"code": code, "message": message},
        }));
    }

    pub fn event(&self, subscription: u64, event_type: &str, data: Value) {
        self.send_json(json!({
            "type": "event",
            "id": subscription,
            "event": {
                "event_type": event_type,
                "data": data,
                "origin": "LOCAL",
                "time_fired": "2024-06-01T12:00:00+00:00",
            },
        }));
    }

    /// Closes the connection from the hub side.
    pub fn drop_connection(&self) {
        let _ = self.to_client.send(Message::Close(None));
    }

    pub fn stop_answering_pings(&self) {
        self.state.answer_pings.store(false, Ordering::SeqCst);
    }

    pub fn frames_received(&self) -> usize {
        self.state.frames.load(Ordering::SeqCst)
    }

    pub fn pings_received(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// A request already forwarded to the test, without waiting.
    pub fn try_next_request(&mut self) -> Option<WireMessage> {
        self.requests.try_recv().ok()
    }

    /// Next request the hub did not answer on its own.
    pub async fn next_request(&mut self) -> WireMessage {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("no request in time")
            .expect("hub connection closed")
    }

    /// Hub subscription id created for `event_type`, if any.
    pub fn subscription_for(&self, event_type: &str) -> Option<u64> {
        self.state
            .subscribed
            .lock()
            .unwrap()
            .iter()
            .find(|(_, t)| t == event_type)
            .map(|(id, _)| *id)
    }

    /// Waits until the client subscribed to `event_type` on this hub.
    pub async fn wait_subscription(&self, event_type: &str) -> u64 {
        for _ in 0..1000 {
            if let Some(id) = self.subscription_for(event_type) {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never subscribed to {event_type}");
    }

    /// Waits until the client cancelled hub subscription `id`.
    pub async fn wait_unsubscribed(&self, id: u64) {
        for _ in 0..1000 {
            if self.state.unsubscribed.lock().unwrap().contains(&id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never unsubscribed {id}");
    }
}

async fn drive(
    mut inbox: mpsc::UnboundedReceiver<Message>,
    outbox: mpsc::UnboundedSender<Message>,
    requests: mpsc::UnboundedSender<WireMessage>,
    state: Arc<HubState>,
    token: String,
) {
    let send = |msg: WireMessage| {
        let text = serde_json::to_string(&msg).unwrap();
        let _ = outbox.send(Message::Text(text.into()));
    };

    send(WireMessage::AuthRequired {
        ha_version: Some(HUB_VERSION.into()),
    });
    match next(&mut inbox).await {
        Some(WireMessage::Auth { access_token }) if access_token == token => {
            send(WireMessage::AuthOk {
                ha_version: Some(HUB_VERSION.into()),
            });
        }
        _ => {
            send(WireMessage::AuthInvalid {
                message: Some("Invalid access token".into()),
            });
            let _ = outbox.send(Message::Close(None));
            return;
        }
    }

    let ok = |id: u64| WireMessage::Result {
        id,
        success: true,
        result: None,
        error: None,
    };
    while let Some(msg) = next(&mut inbox).await {
        match msg {
            WireMessage::Ping { id } => {
                state.pings.fetch_add(1, Ordering::SeqCst);
                if state.answer_pings.load(Ordering::SeqCst) {
                    send(WireMessage::Pong { id });
                }
            }
            WireMessage::SubscribeEvents { id, event_type } => {
                state
                    .subscribed
                    .lock()
                    .unwrap()
                    .push((id, event_type.unwrap_or_default()));
                send(ok(id));
            }
            WireMessage::UnsubscribeEvents { id, subscription } => {
                state.unsubscribed.lock().unwrap().push(subscription);
                send(ok(id));
            }
            other => {
                let _ = requests.send(other);
            }
        }
    }
}

async fn next(inbox: &mut mpsc::UnboundedReceiver<Message>) -> Option<WireMessage> {
    loop {
        match inbox.recv().await? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Config with a 1 s backoff base and no jitter.
pub fn config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new(URL, TOKEN);
    config.reconnect_interval = Duration::from_millis(1000);
    config.max_retries = 5;
    config.jitter = 0.0;
    config
}

pub async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("state {state} not reached"))
        .expect("manager dropped");
}

/// Drains events until one matches `pred`.
pub async fn expect_event(
    events: &mut mpsc::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("expected event not emitted")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Every event already queued.
pub fn drain(events: &mut mpsc::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
