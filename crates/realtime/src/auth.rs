//! Bearer credential → authenticated, non-revoked session.
//!
//! Signature and expiry checks belong to a [`TokenVerifier`]; this module
//! adds the revocation and session checks on top:
//!
//! 1. verify the credential (`InvalidToken`),
//! 2. consult the blacklist, failing closed if the cache cannot answer
//!    (`TokenRevoked` / `Store`),
//! 3. load the session through the cache-aside store (`SessionNotFound`,
//!    `IdentityMismatch`).

use std::sync::Arc;
use std::time::Duration;

use ussdhub_core::types::{DbId, Timestamp};

use crate::error::AuthError;
use crate::session::{remaining_until, SessionRecord, SessionStore};

/// Claims a verifier extracts from a valid credential.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    pub identity_id: DbId,
    /// Session token (`jti`) the credential was issued for.
    pub session_token: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub device: Option<String>,
    pub expires_at: Timestamp,
}

impl VerifiedToken {
    /// Remaining credential lifetime; zero once expired.
    pub fn remaining_lifetime(&self) -> Duration {
        remaining_until(self.expires_at).unwrap_or(Duration::ZERO)
    }
}

/// Verifies a bearer credential's signature and expiry.
pub trait TokenVerifier: Send + Sync + 'static {
    /// Fails with [`AuthError::InvalidToken`] on any verification failure.
    fn verify(&self, bearer: &str) -> Result<VerifiedToken, AuthError>;
}

/// A verified credential paired with its live session.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub token: VerifiedToken,
    pub session: SessionRecord,
}

impl AuthenticatedSession {
    pub fn identity_id(&self) -> DbId {
        self.token.identity_id
    }

    pub fn session_token(&self) -> &str {
        &self.token.session_token
    }

    /// Device label, preferring the session's over the credential's.
    pub fn device(&self) -> Option<String> {
        self.session
            .device
            .clone()
            .or_else(|| self.token.device.clone())
    }
}

/// Runs the full authentication chain for a bearer credential.
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    sessions: Arc<SessionStore>,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, sessions: Arc<SessionStore>) -> Self {
        Self { verifier, sessions }
    }

    pub async fn authenticate(&self, bearer: &str) -> Result<AuthenticatedSession, AuthError> {
        let token = self.verifier.verify(bearer)?;

        match self.sessions.is_blacklisted(&token.session_token).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!(
                    identity_id = token.identity_id,
                    "Rejected revoked token"
                );
                return Err(AuthError::TokenRevoked);
            }
            Err(e) => {
                tracing::error!(
                    identity_id = token.identity_id,
                    error = %e,
                    "Blacklist unavailable, rejecting credential"
                );
                return Err(e);
            }
        }

        let session = self
            .sessions
            .get(token.identity_id, &token.session_token)
            .await?;
        if !session.is_active {
            return Err(AuthError::SessionNotFound);
        }

        Ok(AuthenticatedSession { token, session })
    }
}
