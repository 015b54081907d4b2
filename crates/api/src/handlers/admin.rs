//! Handlers for `/admin` realtime operations.
//!
//! All handlers require an elevated role via [`RequireAdmin`].

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use ussdhub_core::channels::{CHANNEL_NOTIFICATIONS, CHANNEL_SYSTEM};
use ussdhub_core::types::DbId;
use ussdhub_db::repositories::NotificationRepo;
use ussdhub_realtime::envelope::{
    AlertLevel, NotificationCountPayload, NotificationPayload, ServerEvent, SystemAlertPayload,
};
use ussdhub_realtime::hub::{BroadcastEnvelope, HubStats, Target};
use ussdhub_realtime::rate_limit::RateLimitScope;
use ussdhub_realtime::AuthError;
use validator::Validate;

use crate::error::AppResult;
use crate::middleware::rbac::RequireAdmin;
use crate::response::DataResponse;
use crate::state::AppState;

const DEFAULT_DISCONNECT_REASON: &str = "disconnected_by_admin";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for `POST /admin/users/{id}/disconnect`.
#[derive(Debug, Deserialize, Validate)]
pub struct DisconnectRequest {
    #[validate(length(min = 1, max = 128))]
    pub reason: Option<String>,
    /// Also invalidate every session so the user cannot reconnect.
    #[serde(default)]
    pub revoke_sessions: bool,
}

/// Request body for `POST /admin/users/{id}/notify`.
#[derive(Debug, Deserialize, Validate)]
pub struct NotifyRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub body: String,
    #[validate(length(max = 512))]
    pub link: Option<String>,
}

/// Request body for `POST /admin/broadcast`.
#[derive(Debug, Deserialize, Validate)]
pub struct BroadcastRequest {
    pub level: AlertLevel,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 2000))]
    pub message: String,
    /// Defaults to `system`.
    #[validate(length(min = 1, max = 64))]
    pub channel: Option<String>,
    /// Restrict delivery to these users; everyone when absent.
    pub user_ids: Option<Vec<DbId>>,
}

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    /// Connections closed.
    pub closed: usize,
    /// Sessions invalidated, when `revoke_sessions` was set.
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub notification_id: DbId,
    /// Connections the notification was delivered to.
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct RealtimeStatsResponse {
    #[serde(flatten)]
    pub stats: HubStats,
    pub online: Vec<DbId>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/admin/users/{id}/disconnect
///
/// Close every live connection of a user. With `revoke_sessions` the user's
/// sessions are invalidated too, so reconnecting fails.
pub async fn disconnect_user(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(user_id): Path<DbId>,
    Json(input): Json<DisconnectRequest>,
) -> AppResult<Json<DataResponse<DisconnectResponse>>> {
    input.validate()?;
    let reason = input
        .reason
        .as_deref()
        .unwrap_or(DEFAULT_DISCONNECT_REASON);

    let closed = if input.revoke_sessions {
        state.realtime.revoke_all(user_id, reason).await?
    } else {
        state.realtime.hub.disconnect_user(user_id, reason).await?
    };

    tracing::info!(
        admin_id = admin.user_id,
        user_id,
        closed,
        revoked = input.revoke_sessions,
        "Admin disconnected user"
    );
    Ok(Json(DataResponse {
        data: DisconnectResponse {
            closed,
            revoked: input.revoke_sessions,
        },
    }))
}

/// POST /api/v1/admin/users/{id}/notify
///
/// Store an in-app notification and push it, plus the new unread count, to
/// the user's connections subscribed to `notifications`.
pub async fn notify_user(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(user_id): Path<DbId>,
    Json(input): Json<NotifyRequest>,
) -> AppResult<Json<DataResponse<NotifyResponse>>> {
    input.validate()?;

    let notification =
        NotificationRepo::create(&state.pool, user_id, &input.title, &input.body).await?;
    let unread = NotificationRepo::count_unread(&state.pool, user_id).await?;

    let hub = &state.realtime.hub;
    let delivered = hub
        .broadcast_and_count(BroadcastEnvelope::to_identity(
            user_id,
            CHANNEL_NOTIFICATIONS,
            ServerEvent::Notification(NotificationPayload {
                notification_id: notification.id,
                title: notification.title,
                body: notification.body,
                link: input.link,
            }),
        ))
        .await?;
    hub.broadcast(BroadcastEnvelope::to_identity(
        user_id,
        CHANNEL_NOTIFICATIONS,
        ServerEvent::NotificationCount(NotificationCountPayload { unread }),
    ))
    .await?;

    tracing::info!(
        admin_id = admin.user_id,
        user_id,
        notification_id = notification.id,
        delivered,
        "Notification sent"
    );
    Ok(Json(DataResponse {
        data: NotifyResponse {
            notification_id: notification.id,
            delivered,
        },
    }))
}

/// POST /api/v1/admin/broadcast
///
/// Push a `system:alert` to a channel. Counted against the caller's API
/// quota.
pub async fn broadcast(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Json(input): Json<BroadcastRequest>,
) -> AppResult<Json<DataResponse<BroadcastResponse>>> {
    input.validate()?;

    let subject = admin.user_id.to_string();
    let decision = state
        .limiter
        .check_quota(RateLimitScope::Api, &subject, state.config.rate_limit.api)
        .await
        .map_err(AuthError::from)?;
    if !decision.allowed {
        let retry_after = state
            .limiter
            .window_remaining(RateLimitScope::Api, &subject)
            .await
            .ok()
            .flatten();
        return Err(AuthError::RateLimited { retry_after }.into());
    }

    let target = match input.user_ids {
        Some(ids) => Target::Identities(ids),
        None => Target::All,
    };
    let channel = input.channel.unwrap_or_else(|| CHANNEL_SYSTEM.to_string());
    let event = ServerEvent::SystemAlert(SystemAlertPayload {
        level: input.level,
        title: input.title,
        message: input.message,
    });

    let delivered = state
        .realtime
        .hub
        .broadcast_and_count(BroadcastEnvelope::new(target, channel.as_str(), event))
        .await?;

    tracing::info!(admin_id = admin.user_id, channel = %channel, delivered, "Admin broadcast");
    Ok(Json(DataResponse {
        data: BroadcastResponse { delivered },
    }))
}

/// GET /api/v1/admin/realtime/stats
pub async fn realtime_stats(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> AppResult<Json<DataResponse<RealtimeStatsResponse>>> {
    let hub = &state.realtime.hub;
    let stats = hub.stats().await?;
    let online = hub.online_identities().await?;
    Ok(Json(DataResponse {
        data: RealtimeStatsResponse { stats, online },
    }))
}
