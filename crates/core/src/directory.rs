//! The relational collaborator behind the session store.
//!
//! [`SessionDirectory`] is the minimum surface the realtime core needs from
//! the CRUD layer: durable session rows and identity lookups. The Postgres
//! implementation lives in `ussdhub-db`; tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};

/// A durable session row as seen by the realtime core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: DbId,
    pub identity_id: DbId,
    /// Unique session token (the access token's `jti`).
    pub session_token: String,
    pub refresh_token_hash: Option<String>,
    pub device: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub is_active: bool,
    pub last_activity_at: Timestamp,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

/// Input for creating a durable session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub identity_id: DbId,
    pub session_token: String,
    pub refresh_token_hash: Option<String>,
    pub device: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: Timestamp,
}

/// An identity with its resolved roles and permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: DbId,
    pub username: String,
    pub is_active: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

/// Failure reported by a [`SessionDirectory`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("session directory error: {0}")]
pub struct DirectoryError(pub String);

/// Durable system of record for sessions and identities.
#[async_trait]
pub trait SessionDirectory: Send + Sync + 'static {
    /// Find a session row by its session token, active or not.
    async fn find_session_by_token(
        &self,
        token: &str,
    ) -> Result<Option<StoredSession>, DirectoryError>;

    /// Persist a new session row.
    async fn create_session(&self, input: &NewSession) -> Result<StoredSession, DirectoryError>;

    /// Active, unexpired session rows of an identity.
    async fn find_active_sessions(
        &self,
        identity_id: DbId,
    ) -> Result<Vec<StoredSession>, DirectoryError>;

    /// Mark one session row inactive. Returns `true` if a row changed.
    async fn invalidate_session(&self, id: DbId) -> Result<bool, DirectoryError>;

    /// Mark every active session row of an identity inactive.
    async fn invalidate_all_sessions(&self, identity_id: DbId) -> Result<u64, DirectoryError>;

    /// Bump the `last_activity_at` marker of a session row.
    async fn update_session_activity(&self, id: DbId) -> Result<(), DirectoryError>;

    /// Resolve an identity with roles and permissions.
    async fn find_identity_by_id(&self, id: DbId) -> Result<Option<Identity>, DirectoryError>;
}
