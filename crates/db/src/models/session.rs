//! User session model and DTOs.

use sqlx::FromRow;
use ussdhub_core::directory::StoredSession;
use ussdhub_core::types::{DbId, Timestamp};

/// A session row from the `user_sessions` table.
#[derive(Debug, Clone, FromRow)]
pub struct UserSession {
    pub id: DbId,
    pub user_id: DbId,
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

/// DTO for creating a new user session.
pub struct CreateSession {
    pub user_id: DbId,
    pub session_token: String,
    pub refresh_token_hash: Option<String>,
    pub device: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: Timestamp,
}

impl From<UserSession> for StoredSession {
    fn from(row: UserSession) -> Self {
        Self {
            id: row.id,
            identity_id: row.user_id,
            session_token: row.session_token,
            refresh_token_hash: row.refresh_token_hash,
            device: row.device,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            is_active: row.is_active,
            last_activity_at: row.last_activity_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}
