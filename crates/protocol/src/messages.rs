use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MessageKind;
use crate::types::{HubEvent, ResultError, ServiceCall};

/// Every frame exchanged with the hub, keyed by its `type` field.
///
/// Payload shapes are fixed per kind, so a frame is fully typed once
/// decoded. Unrecognised kinds decode to [`WireMessage::Unknown`] rather
/// than failing, since newer hubs add frame types over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    AuthRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },
    Auth {
        access_token: String,
    },
    AuthOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SubscribeEvents {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },
    UnsubscribeEvents {
        id: u64,
        subscription: u64,
    },
    CallService {
        id: u64,
        domain: String,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Value>,
    },
    GetStates {
        id: u64,
    },
    GetConfig {
        id: u64,
    },
    Ping {
        id: u64,
    },
    Pong {
        #[serde(default)]
        id: u64,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ResultError>,
    },
    Event {
        #[serde(default)]
        id: u64,
        event: HubEvent,
    },
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    /// Kind of this frame, `None` for [`WireMessage::Unknown`].
    pub fn kind(&self) -> Option<MessageKind> {
        let kind = match self {
            Self::AuthRequired { .. } => MessageKind::AuthRequired,
            Self::Auth { .. } => MessageKind::Auth,
            Self::AuthOk { .. } => MessageKind::AuthOk,
            Self::AuthInvalid { .. } => MessageKind::AuthInvalid,
            Self::SubscribeEvents { .. } => MessageKind::SubscribeEvents,
            Self::UnsubscribeEvents { .. } => MessageKind::UnsubscribeEvents,
            Self::CallService { .. } => MessageKind::CallService,
            Self::GetStates { .. } => MessageKind::GetStates,
            Self::GetConfig { .. } => MessageKind::GetConfig,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
            Self::Result { .. } => MessageKind::Result,
            Self::Event { .. } => MessageKind::Event,
            Self::Unknown => return None,
        };
        Some(kind)
    }

    /// Correlation id, `None` for handshake frames which carry none.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::SubscribeEvents { id, .. }
            | Self::UnsubscribeEvents { id, .. }
            | Self::CallService { id, .. }
            | Self::GetStates { id }
            | Self::GetConfig { id }
            | Self::Ping { id }
            | Self::Pong { id }
            | Self::Result { id, .. }
            | Self::Event { id, .. } => Some(*id),
            Self::AuthRequired { .. }
            | Self::Auth { .. }
            | Self::AuthOk { .. }
            | Self::AuthInvalid { .. }
            | Self::Unknown => None,
        }
    }
}

/// An outbound request before a correlation id has been assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SubscribeEvents { event_type: Option<String> },
    UnsubscribeEvents { subscription: u64 },
    CallService(ServiceCall),
    GetStates,
    GetConfig,
    Ping,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SubscribeEvents { .. } => MessageKind::SubscribeEvents,
            Self::UnsubscribeEvents { .. } => MessageKind::UnsubscribeEvents,
            Self::CallService(_) => MessageKind::CallService,
            Self::GetStates => MessageKind::GetStates,
            Self::GetConfig => MessageKind::GetConfig,
            Self::Ping => MessageKind::Ping,
        }
    }

    /// Binds the request to a correlation id.
    pub fn into_message(self, id: u64) -> WireMessage {
        match self {
            Self::SubscribeEvents { event_type } => WireMessage::SubscribeEvents { id, event_type },
            Self::UnsubscribeEvents { subscription } => {
                WireMessage::UnsubscribeEvents { id, subscription }
            }
            Self::CallService(call) => WireMessage::CallService {
                id,
                domain: call.domain,
                service: call.service,
                service_data: call.service_data,
                target: call.target,
            },
            Self::GetStates => WireMessage::GetStates { id },
            Self::GetConfig => WireMessage::GetConfig { id },
            Self::Ping => WireMessage::Ping { id },
        }
    }
}
