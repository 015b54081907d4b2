//! Postgres-backed [`SessionDirectory`].

use async_trait::async_trait;
use ussdhub_core::directory::{
    DirectoryError, Identity, NewSession, SessionDirectory, StoredSession,
};
use ussdhub_core::types::DbId;

use crate::models::session::CreateSession;
use crate::repositories::{SessionRepo, UserRepo};
use crate::DbPool;

/// Session directory over the `user_sessions` and `users` tables.
#[derive(Clone)]
pub struct PgSessionDirectory {
    pool: DbPool,
}

impl PgSessionDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn db_err(err: sqlx::Error) -> DirectoryError {
    DirectoryError(err.to_string())
}

#[async_trait]
impl SessionDirectory for PgSessionDirectory {
    async fn find_session_by_token(
        &self,
        token: &str,
    ) -> Result<Option<StoredSession>, DirectoryError> {
        let row = SessionRepo::find_by_token(&self.pool, token)
            .await
            .map_err(db_err)?;
        Ok(row.map(StoredSession::from))
    }

    async fn create_session(&self, input: &NewSession) -> Result<StoredSession, DirectoryError> {
        let create = CreateSession {
            user_id: input.identity_id,
            session_token: input.session_token.clone(),
            refresh_token_hash: input.refresh_token_hash.clone(),
            device: input.device.clone(),
            ip_address: input.ip_address.clone(),
            user_agent: input.user_agent.clone(),
            expires_at: input.expires_at,
        };
        let row = SessionRepo::create(&self.pool, &create)
            .await
            .map_err(db_err)?;
        Ok(row.into())
    }

    async fn find_active_sessions(
        &self,
        identity_id: DbId,
    ) -> Result<Vec<StoredSession>, DirectoryError> {
        let rows = SessionRepo::list_active_for_user(&self.pool, identity_id)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(StoredSession::from).collect())
    }

    async fn invalidate_session(&self, id: DbId) -> Result<bool, DirectoryError> {
        SessionRepo::invalidate(&self.pool, id).await.map_err(db_err)
    }

    async fn invalidate_all_sessions(&self, identity_id: DbId) -> Result<u64, DirectoryError> {
        SessionRepo::invalidate_all_for_user(&self.pool, identity_id)
            .await
            .map_err(db_err)
    }

    async fn update_session_activity(&self, id: DbId) -> Result<(), DirectoryError> {
        SessionRepo::touch_activity(&self.pool, id)
            .await
            .map_err(db_err)
    }

    async fn find_identity_by_id(&self, id: DbId) -> Result<Option<Identity>, DirectoryError> {
        let Some(user) = UserRepo::find_by_id(&self.pool, id).await.map_err(db_err)? else {
            return Ok(None);
        };
        let roles = UserRepo::role_names(&self.pool, id).await.map_err(db_err)?;
        let permissions = UserRepo::permission_names(&self.pool, id)
            .await
            .map_err(db_err)?;
        tracing::trace!(user_id = id, roles = roles.len(), "Resolved identity");
        Ok(Some(Identity {
            id: user.id,
            username: user.username,
            is_active: user.is_active,
            roles,
            permissions,
        }))
    }
}
