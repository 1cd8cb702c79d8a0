//! Connection configuration.
//!
//! Durations are written as integer milliseconds when (de)serialized, so a
//! config can come straight from JSON or TOML. The camelCase aliases accept
//! configs produced by web front-ends.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use homelink_protocol::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_JITTER, DEFAULT_MAX_RECONNECT_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_MESSAGE_TIMEOUT,
    DEFAULT_PONG_TIMEOUT, DEFAULT_RECONNECT_INTERVAL,
};

use crate::error::ConnectionError;

/// Immutable settings for one connection. Replace wholesale to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Hub WebSocket endpoint, e.g. `ws://hub.local:8123/api/websocket`.
    pub url: String,

    /// Access token sent during the auth handshake.
    pub token: String,

    /// Base delay of the reconnect backoff.
    #[serde(
        default = "default_reconnect_interval",
        with = "duration_ms",
        alias = "reconnectInterval"
    )]
    pub reconnect_interval: Duration,

    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// Deadline for each request to receive its result.
    #[serde(
        default = "default_message_timeout",
        with = "duration_ms",
        alias = "messageTimeout"
    )]
    pub message_timeout: Duration,

    /// Upper bound for a single backoff delay.
    #[serde(
        default = "default_max_reconnect_delay",
        with = "duration_ms",
        alias = "maxReconnectDelay"
    )]
    pub max_reconnect_delay: Duration,

    #[serde(default = "default_backoff_factor", alias = "backoffFactor")]
    pub backoff_factor: f64,

    /// Upper bound of the random fraction added to each backoff delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Deadline for opening the transport plus the auth handshake.
    #[serde(
        default = "default_handshake_timeout",
        with = "duration_ms",
        alias = "handshakeTimeout"
    )]
    pub handshake_timeout: Duration,

    #[serde(
        default = "default_health_check_interval",
        with = "duration_ms",
        alias = "healthCheckInterval"
    )]
    pub health_check_interval: Duration,

    #[serde(
        default = "default_pong_timeout",
        with = "duration_ms",
        alias = "pongTimeout"
    )]
    pub pong_timeout: Duration,

    /// Time the breaker stays open before allowing a probe.
    /// `None` keeps it open until reset by the caller.
    #[serde(
        default,
        with = "option_duration_ms",
        skip_serializing_if = "Option::is_none",
        alias = "circuitCooldown"
    )]
    pub circuit_cooldown: Option<Duration>,

    /// Keep local subscriptions across automatic reconnects and re-send them.
    #[serde(default, alias = "resubscribeOnReconnect")]
    pub resubscribe_on_reconnect: bool,
}

fn default_reconnect_interval() -> Duration {
    DEFAULT_RECONNECT_INTERVAL
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_message_timeout() -> Duration {
    DEFAULT_MESSAGE_TIMEOUT
}

fn default_max_reconnect_delay() -> Duration {
    DEFAULT_MAX_RECONNECT_DELAY
}

fn default_backoff_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

fn default_handshake_timeout() -> Duration {
    DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_health_check_interval() -> Duration {
    DEFAULT_HEALTH_CHECK_INTERVAL
}

fn default_pong_timeout() -> Duration {
    DEFAULT_PONG_TIMEOUT
}

impl ConnectionConfig {
    /// Creates a config with every tuning knob at its default.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            reconnect_interval: default_reconnect_interval(),
            max_retries: default_max_retries(),
            message_timeout: default_message_timeout(),
            max_reconnect_delay: default_max_reconnect_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: default_jitter(),
            handshake_timeout: default_handshake_timeout(),
            health_check_interval: default_health_check_interval(),
            pong_timeout: default_pong_timeout(),
            circuit_cooldown: None,
            resubscribe_on_reconnect: false,
        }
    }

    /// Checks the config for values the manager cannot work with.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let invalid = |msg: &str| Err(ConnectionError::InvalidConfig(msg.to_string()));

        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return invalid("url must use the ws:// or wss:// scheme");
        }
        if self.token.is_empty() {
            return invalid("token must not be empty");
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1");
        }
        for (name, value) in [
            ("reconnect_interval", self.reconnect_interval),
            ("message_timeout", self.message_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("health_check_interval", self.health_check_interval),
            ("pong_timeout", self.pong_timeout),
        ] {
            if value.is_zero() {
                return invalid(&format!("{name} must be greater than zero"));
            }
        }
        if self.max_reconnect_delay < self.reconnect_interval {
            return invalid("max_reconnect_delay must be >= reconnect_interval");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("backoff_factor must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return invalid("jitter must be between 0.0 and 1.0");
        }
        if self.circuit_cooldown.is_some_and(|d| d.is_zero()) {
            return invalid("circuit_cooldown must be greater than zero when set");
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}
