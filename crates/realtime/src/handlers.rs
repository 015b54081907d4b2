//! Message-type dispatch table.
//!
//! Feature modules register a [`MessageHandler`] per inbound `type` while the
//! application is being wired. The registry is frozen by
//! [`HandlerRegistryBuilder::build`] and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use ussdhub_core::types::DbId;

use crate::envelope::{InboundEnvelope, NotificationCountPayload, ServerEvent};
use crate::hub::ConnectionId;

/// Connection facts a handler runs against.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub connection_id: ConnectionId,
    pub identity_id: DbId,
    pub session_token: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::InvalidPayload(_) => "INVALID_PAYLOAD",
            HandlerError::Forbidden(_) => "FORBIDDEN",
            HandlerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show the client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            HandlerError::Internal(_) => "An internal error occurred".into(),
            other => other.to_string(),
        }
    }
}

/// Handles one inbound message type.
///
/// `Ok(Some(event))` is sent back to the originating connection with the
/// request's correlation id; `Ok(None)` sends nothing.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &InboundEnvelope,
    ) -> Result<Option<ServerEvent>, HandlerError>;
}

/// Outcome of routing an envelope through the registry.
#[derive(Debug)]
pub enum Dispatch {
    Handled(Result<Option<ServerEvent>, HandlerError>),
    NoHandler,
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for `kind`. A later registration replaces an
    /// earlier one for the same type.
    pub fn register(mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::warn!(kind = %kind, "Replacing previously registered message handler");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable lookup from message type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, ctx: &HandlerContext, envelope: &InboundEnvelope) -> Dispatch {
        match self.handlers.get(&envelope.kind) {
            Some(handler) => Dispatch::Handled(handler.handle(ctx, envelope).await),
            None => Dispatch::NoHandler,
        }
    }
}

// ---------------------------------------------------------------------------
// notification:read
// ---------------------------------------------------------------------------

pub const TYPE_NOTIFICATION_READ: &str = "notification:read";

/// Per-identity notification inbox backing the `notification:read` handler.
#[async_trait]
pub trait NotificationInbox: Send + Sync + 'static {
    /// Mark a notification read. `false` if it does not exist or belongs to
    /// another identity.
    async fn mark_read(&self, identity_id: DbId, notification_id: DbId) -> Result<bool, String>;

    async fn unread_count(&self, identity_id: DbId) -> Result<i64, String>;
}

#[derive(Debug, Deserialize)]
struct NotificationRead {
    notification_id: DbId,
}

/// Acknowledges a notification and replies with the new unread count.
pub struct NotificationAckHandler {
    inbox: Arc<dyn NotificationInbox>,
}

impl NotificationAckHandler {
    pub fn new(inbox: Arc<dyn NotificationInbox>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl MessageHandler for NotificationAckHandler {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        envelope: &InboundEnvelope,
    ) -> Result<Option<ServerEvent>, HandlerError> {
        let payload: NotificationRead = envelope
            .decode()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let marked = self
            .inbox
            .mark_read(ctx.identity_id, payload.notification_id)
            .await
            .map_err(HandlerError::Internal)?;
        if !marked {
            tracing::debug!(
                identity_id = ctx.identity_id,
                notification_id = payload.notification_id,
                "Notification not found or already read"
            );
        }

        let unread = self
            .inbox
            .unread_count(ctx.identity_id)
            .await
            .map_err(HandlerError::Internal)?;
        Ok(Some(ServerEvent::NotificationCount(
            NotificationCountPayload { unread },
        )))
    }
}
