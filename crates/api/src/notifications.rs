//! Postgres-backed inbox for the `notification:read` realtime handler.

use async_trait::async_trait;
use ussdhub_core::types::DbId;
use ussdhub_db::repositories::NotificationRepo;
use ussdhub_db::DbPool;
use ussdhub_realtime::handlers::NotificationInbox;

pub struct PgNotificationInbox {
    pool: DbPool,
}

impl PgNotificationInbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationInbox for PgNotificationInbox {
    async fn mark_read(&self, identity_id: DbId, notification_id: DbId) -> Result<bool, String> {
        NotificationRepo::mark_read(&self.pool, notification_id, identity_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn unread_count(&self, identity_id: DbId) -> Result<i64, String> {
        NotificationRepo::count_unread(&self.pool, identity_id)
            .await
            .map_err(|e| e.to_string())
    }
}
