use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Outbound payloads
// ---------------------------------------------------------------------------

/// A service invocation on the hub, e.g. `light.turn_on`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
}

impl ServiceCall {
    /// Creates a call with no data and no target.
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data: None,
            target: None,
        }
    }

    /// Targets a single entity (`{"entity_id": ...}`).
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        let mut target = Map::new();
        target.insert("entity_id".into(), Value::String(entity_id.into()));
        self.target = Some(Value::Object(target));
        self
    }

    /// Sets an arbitrary target object.
    pub fn with_target(mut self, target: Value) -> Self {
        self.target = Some(target);
        self
    }

    /// Sets the `service_data` object.
    pub fn with_data(mut self, data: Value) -> Self {
        self.service_data = Some(data);
        self
    }

    /// `domain.service`, used in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.domain, self.service)
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

/// Error body of a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub code: String,
    pub message: String,
}

/// An event pushed by the hub to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_fired: Option<DateTime<Utc>>,
}

/// Event type emitted whenever an entity changes state.
pub const STATE_CHANGED: &str = "state_changed";

impl HubEvent {
    /// Decodes `data` as [`StateChangedData`] when this is a `state_changed` event.
    ///
    /// Returns `None` for any other event type.
    pub fn state_changed(&self) -> Option<Result<StateChangedData, serde_json::Error>> {
        if self.event_type != STATE_CHANGED {
            return None;
        }
        Some(serde_json::from_value(self.data.clone()))
    }
}

/// Snapshot of one entity as reported by `get_states` or `state_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Payload of a `state_changed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedData {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    #[serde(default)]
    pub new_state: Option<EntityState>,
}

/// Hub configuration returned by `get_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub location_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub unit_system: Map<String, Value>,
}
