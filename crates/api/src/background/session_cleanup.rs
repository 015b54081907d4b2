//! Periodic purge of long-expired session rows.
//!
//! The cache tier expires on its own; this keeps `user_sessions` from
//! growing without bound. Rows are kept for a retention period after they
//! expire so logout and revocation history stays queryable.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use ussdhub_db::repositories::SessionRepo;

/// Default retention after expiry: 30 days.
const DEFAULT_RETENTION_DAYS: i64 = 30;

/// How often the cleanup job runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Run the session cleanup loop until `cancel` is triggered.
///
/// Deletes rows whose `expires_at` is older than `SESSION_RETENTION_DAYS`
/// (defaults to 30).
pub async fn run(pool: PgPool, cancel: CancellationToken) {
    let retention_days: i64 = std::env::var("SESSION_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|days| *days >= 0)
        .unwrap_or(DEFAULT_RETENTION_DAYS);

    tracing::info!(
        retention_days,
        interval_secs = CLEANUP_INTERVAL.as_secs(),
        "Session cleanup job started"
    );

    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Session cleanup job stopping");
                break;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                match SessionRepo::delete_expired_before(&pool, cutoff).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "Session cleanup: purged rows");
                    }
                    Ok(_) => tracing::debug!("Session cleanup: nothing to purge"),
                    Err(e) => tracing::error!(error = %e, "Session cleanup failed"),
                }
            }
        }
    }
}
