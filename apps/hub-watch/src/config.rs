//! Watcher configuration.
//!
//! Stored as TOML, by default at `~/.config/homelink/hub-watch.toml`:
//!
//! ```toml
//! events = ["state_changed"]
//!
//! [connection]
//! url = "ws://homeassistant.local:8123/api/websocket"
//! token = "..."
//! ```
//!
//! `HOMELINK_TOKEN` overrides the token from the file.
//!
//! The watcher subscribes once at startup, so
//! `connection.resubscribe_on_reconnect` is always on: without it the first
//! reconnect would silently end the watch.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use homelink_connection::ConnectionConfig;

/// Environment variable that overrides `connection.token`.
pub const TOKEN_ENV: &str = "HOMELINK_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub connection: ConnectionConfig,

    /// Event types to subscribe to.
    #[serde(default = "default_events")]
    pub events: Vec<String>,

    /// How often to log connection metrics, in seconds. 0 disables.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_events() -> Vec<String> {
    vec![homelink_connection::STATE_CHANGED.to_string()]
}

fn default_metrics_interval() -> u64 {
    60
}

impl WatchConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            config.connection.token = token;
        }
        config.connection.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        if !config.connection.resubscribe_on_reconnect {
            tracing::debug!("enabling resubscribe_on_reconnect for the watcher");
            config.connection.resubscribe_on_reconnect = true;
        }
        Ok(config)
    }
}

/// Returns the platform-specific configuration file path.
pub fn default_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("homelink").join("hub-watch.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("homelink")
            .join("hub-watch.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = WatchConfig::parse(
            r#"
            [connection]
            url = "ws://hub.local:8123/api/websocket"
            token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.events, vec!["state_changed"]);
        assert_eq!(config.metrics_interval_secs, 60);
        assert_eq!(config.connection.max_retries, 5);
        assert_eq!(
            config.connection.reconnect_interval,
            Duration::from_millis(5000)
        );
        assert!(config.connection.circuit_cooldown.is_none());
        assert!(config.connection.resubscribe_on_reconnect);
    }

    #[test]
    fn watcher_always_resubscribes() {
        let config = WatchConfig::parse(
            r#"
            [connection]
            url = "ws://hub.local:8123/api/websocket"
            token = "abc"
            resubscribe_on_reconnect = false
            "#,
        )
        .unwrap();
        assert!(config.connection.resubscribe_on_reconnect);
    }

    #[test]
    fn tuning_knobs_are_milliseconds() {
        let config = WatchConfig::parse(
            r#"
            events = ["state_changed", "call_service"]
            metrics_interval_secs = 0

            [connection]
            url = "wss://hub.example.org/api/websocket"
            token = "abc"
            reconnect_interval = 250
            circuit_cooldown = 30000
            resubscribe_on_reconnect = true
            "#,
        )
        .unwrap();
        assert_eq!(config.events.len(), 2);
        assert_eq!(
            config.connection.reconnect_interval,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.connection.circuit_cooldown,
            Some(Duration::from_secs(30))
        );
        assert!(config.connection.resubscribe_on_reconnect);
    }

    #[test]
    fn missing_connection_is_an_error() {
        assert!(WatchConfig::parse("events = []").is_err());
    }

    #[test]
    fn default_path_ends_with_file_name() {
        assert!(default_path().ends_with("hub-watch.toml"));
    }
}
