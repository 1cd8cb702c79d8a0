//! Client-side connection manager for a home-automation hub.
//!
//! Opens a WebSocket to the hub, authenticates, and keeps the connection
//! alive: correlated request/response calls with timeouts, event
//! subscriptions, health-check pings, exponential backoff and a circuit
//! breaker that stops hammering an unreachable hub.
//!
//! Subscriptions are dropped with the transport unless
//! [`ConnectionConfig::resubscribe_on_reconnect`] is set; the manager then
//! emits [`ConnectionEvent::SubscriptionsDropped`] and the handles report
//! inactive.

mod circuit_breaker;
mod codec;
mod config;
mod error;
mod handshake;
pub mod manager;
mod metrics;
mod middleware;
mod pending;
mod pumps;
pub(crate) mod reconnection;
mod session;
mod subscriptions;
pub mod transport;
pub mod types;

pub use circuit_breaker::{CircuitSnapshot, CircuitState};
pub use codec::MessageCodec;
pub use config::ConnectionConfig;
pub use error::ConnectionError;
pub use manager::{ConnectionManager, ConnectionManagerBuilder};
pub use metrics::ConnectionMetrics;
pub use middleware::{ServiceMiddleware, TimingMiddleware, ValidateServiceCall};
pub use reconnection::BackoffPolicy;
pub use subscriptions::{AsyncEventCallback, EventCallback, Subscription};
pub use transport::{ConnectFuture, Connector, Transport, WsConnector};
pub use types::{ConnectionEvent, ConnectionState};

pub use homelink_protocol::{
    EntityState, HubConfig, HubEvent, Request, STATE_CHANGED, ServiceCall, StateChangedData,
};
