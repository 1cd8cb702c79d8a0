//! hub-watch: connects to a hub and logs everything it reports.
//!
//! Usage: `hub-watch [CONFIG]`. Without an argument the config is read
//! from the platform default path.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use homelink_connection::{ConnectionEvent, ConnectionManager, HubEvent, Subscription};

use config::WatchConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting hub-watch");

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_path);
    let config = WatchConfig::load(&path)?;

    let manager = Arc::new(ConnectionManager::new());
    let events = manager
        .take_events()
        .context("connection events already taken")?;
    tokio::spawn(log_connection_events(manager.clone(), events));

    // Registered before connecting; sent to the hub once connected.
    let mut subscriptions: Vec<Subscription> = Vec::with_capacity(config.events.len());
    for event_type in &config.events {
        subscriptions.push(manager.subscribe(event_type, log_hub_event).await?);
    }

    if let Err(e) = manager.connect(config.connection.clone()).await {
        if !e.is_retryable() {
            return Err(e).context("connecting to hub");
        }
        warn!(error = %e, "initial connection failed, retrying in the background");
    }

    let mut ticker = (config.metrics_interval_secs > 0).then(|| {
        tokio::time::interval(Duration::from_secs(config.metrics_interval_secs))
    });
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for ctrl-c")?;
                break;
            }
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log_metrics(&manager),
        }
    }

    info!("shutting down");
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    manager.disconnect();
    log_metrics(&manager);
    Ok(())
}

fn log_hub_event(event: HubEvent) {
    match event.state_changed() {
        Some(Ok(change)) => info!(
            entity_id = %change.entity_id,
            from = change.old_state.as_ref().map(|s| s.state.as_str()).unwrap_or("-"),
            to = change.new_state.as_ref().map(|s| s.state.as_str()).unwrap_or("-"),
            "state changed"
        ),
        Some(Err(e)) => warn!(error = %e, "malformed state_changed payload"),
        None => info!(event_type = %event.event_type, data = %event.data, "event"),
    }
}

async fn log_connection_events(
    manager: Arc<ConnectionManager>,
    mut events: tokio::sync::mpsc::Receiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected { hub_version } => {
                info!(hub_version = ?hub_version, "hub connected");
                match manager.get_config().await {
                    Ok(hub) => info!(
                        location = %hub.location_name,
                        time_zone = %hub.time_zone,
                        components = hub.components.len(),
                        "hub configuration"
                    ),
                    Err(e) => warn!(error = %e, "failed to fetch hub configuration"),
                }
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            }
            ConnectionEvent::AuthRejected { message } => {
                warn!(%message, "hub rejected the access token");
            }
            ConnectionEvent::CircuitOpened { failures } => {
                warn!(failures, "giving up until the circuit breaker is reset");
            }
            ConnectionEvent::CircuitClosed => info!("circuit breaker closed"),
            ConnectionEvent::SubscriptionsDropped { count } => {
                warn!(count, "hub subscriptions dropped, events are no longer watched");
            }
            ConnectionEvent::StateChanged(_) => {}
        }
    }
}

fn log_metrics(manager: &ConnectionManager) {
    let m = manager.metrics();
    info!(
        state = %manager.state(),
        latency_ms = m.latency.map(|d| d.as_millis() as u64),
        sent = m.messages_sent,
        received = m.messages_received,
        errors = m.error_count,
        reconnects = m.reconnects,
        "connection metrics"
    );
}
