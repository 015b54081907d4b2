use std::sync::Arc;
use std::time::Duration;

use ussdhub_core::directory::SessionDirectory;
use ussdhub_core::types::DbId;

use crate::auth::{Authenticator, TokenVerifier};
use crate::config::RealtimeConfig;
use crate::error::AuthError;
use crate::handlers::HandlerRegistry;
use crate::hub::{Hub, HubHandle};
use crate::session::SessionStore;
use crate::store::VolatileStore;

/// Everything a connection or a publisher needs, built once at startup and
/// passed around explicitly.
#[derive(Clone)]
pub struct Realtime {
    pub hub: HubHandle,
    pub cache: Arc<dyn VolatileStore>,
    pub sessions: Arc<SessionStore>,
    pub authenticator: Arc<Authenticator>,
    pub handlers: Arc<HandlerRegistry>,
    pub config: Arc<RealtimeConfig>,
}

impl Realtime {
    /// Wire the stores together and spawn the hub task.
    pub fn start(
        config: RealtimeConfig,
        cache: Arc<dyn VolatileStore>,
        directory: Arc<dyn SessionDirectory>,
        verifier: Arc<dyn TokenVerifier>,
        handlers: HandlerRegistry,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(Arc::clone(&cache), directory));
        let authenticator = Arc::new(Authenticator::new(verifier, Arc::clone(&sessions)));
        let hub = Hub::start(&config);

        tracing::info!(handlers = handlers.len(), "Realtime context ready");

        Self {
            hub,
            cache,
            sessions,
            authenticator,
            handlers: Arc::new(handlers),
            config: Arc::new(config),
        }
    }

    /// Revoke one session and close its live connections.
    pub async fn revoke_session(
        &self,
        identity_id: DbId,
        session_token: &str,
        remaining: Duration,
        reason: &str,
    ) -> Result<usize, AuthError> {
        self.sessions
            .revoke(identity_id, session_token, remaining)
            .await?;
        Ok(self
            .hub
            .force_logout(identity_id, session_token, reason)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(identity_id, error = %e, "Hub unavailable during revoke");
                0
            }))
    }

    /// Invalidate every session of an identity and close all its connections.
    pub async fn revoke_all(&self, identity_id: DbId, reason: &str) -> Result<usize, AuthError> {
        self.sessions.invalidate_all(identity_id).await?;
        Ok(self
            .hub
            .disconnect_user(identity_id, reason)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(identity_id, error = %e, "Hub unavailable during revoke-all");
                0
            }))
    }
}
