//! Wire envelopes and transport frames.
//!
//! Inbound frames carry `{type, data, metadata?, timestamp?, id?}`. The
//! `type` discriminator is read first and the payload is decoded into a
//! concrete struct right away: built-in control messages become
//! [`ControlMessage`]; other types are handed to the handler registry, which
//! decodes its own payloads.
//!
//! Outbound events are the [`ServerEvent`] union, wrapped in a
//! [`ServerEnvelope`] that adds timestamp, correlation id and metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ussdhub_core::types::{DbId, Timestamp};

/// A transport-level frame, independent of the WebSocket library in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<String>),
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Inbound envelope after the discriminator has been read.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub id: Option<String>,
}

/// Why an inbound frame could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl EnvelopeError {
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::Malformed(_) => "INVALID_MESSAGE",
            EnvelopeError::InvalidPayload { .. } => "INVALID_PAYLOAD",
        }
    }
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: InboundEnvelope =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if envelope.kind.trim().is_empty() {
            return Err(EnvelopeError::Malformed("empty message type".into()));
        }
        Ok(envelope)
    }

    /// Decode `data` into a concrete payload for this envelope's type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone()).map_err(|e| EnvelopeError::InvalidPayload {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// `{channels: [...]}` payload of subscribe/unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelList {
    pub channels: Vec<String>,
}

/// Control messages the connection handles itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Subscribe(ChannelList),
    Unsubscribe(ChannelList),
}

pub const TYPE_PING: &str = "ping";
pub const TYPE_SUBSCRIBE: &str = "subscribe";
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";

impl ControlMessage {
    /// `None` if the envelope is not a built-in control type.
    pub fn from_envelope(envelope: &InboundEnvelope) -> Option<Result<Self, EnvelopeError>> {
        match envelope.kind.as_str() {
            TYPE_PING => Some(Ok(ControlMessage::Ping)),
            TYPE_SUBSCRIBE => Some(envelope.decode().map(ControlMessage::Subscribe)),
            TYPE_UNSUBSCRIBE => Some(envelope.decode().map(ControlMessage::Unsubscribe)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedPayload {
    pub identity_id: DbId,
    pub session_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub server_time: Timestamp,
}

/// Reply to subscribe/unsubscribe listing the channels actually applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionReply {
    pub channels: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: DbId,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationCountPayload {
    pub unread: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionChange {
    pub permission: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleChange {
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNotice {
    pub session_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlertPayload {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
}

/// Every event the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected(ConnectedPayload),
    #[serde(rename = "disconnected")]
    Disconnected(DisconnectedPayload),
    #[serde(rename = "pong")]
    Pong(PongPayload),
    #[serde(rename = "subscribe")]
    Subscribed(SubscriptionReply),
    #[serde(rename = "unsubscribe")]
    Unsubscribed(SubscriptionReply),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "notification")]
    Notification(NotificationPayload),
    #[serde(rename = "notification:count")]
    NotificationCount(NotificationCountPayload),
    #[serde(rename = "permission:granted")]
    PermissionGranted(PermissionChange),
    #[serde(rename = "permission:revoked")]
    PermissionRevoked(PermissionChange),
    #[serde(rename = "role:assigned")]
    RoleAssigned(RoleChange),
    #[serde(rename = "role:removed")]
    RoleRemoved(RoleChange),
    #[serde(rename = "session:expired")]
    SessionExpired(SessionNotice),
    #[serde(rename = "session:revoked")]
    SessionRevoked(SessionNotice),
    #[serde(rename = "session:force_logout")]
    ForceLogout(SessionNotice),
    #[serde(rename = "system:alert")]
    SystemAlert(SystemAlertPayload),
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
            details: None,
        })
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        ServerEvent::Disconnected(DisconnectedPayload {
            reason: reason.into(),
        })
    }
}

/// An outbound event with envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ServerEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            metadata: None,
            timestamp: Utc::now(),
            id: None,
        }
    }

    /// Echo a request's correlation id.
    pub fn reply_to(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ServerEvent> for ServerEnvelope {
    fn from(event: ServerEvent) -> Self {
        ServerEnvelope::new(event)
    }
}
