//! Handlers for the `/auth` resource (login, logout, logout-all).

use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use ussdhub_core::types::DbId;
use ussdhub_db::models::session::CreateSession;
use ussdhub_db::repositories::{SessionRepo, UserRepo};
use ussdhub_realtime::session::{remaining_until, SessionRecord};
use validator::Validate;

use crate::auth::jwt::generate_access_token;
use crate::auth::password::verify_password;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

/// Reason attached to `session:force_logout` when a user logs out.
const REASON_LOGOUT: &str = "logout";
const REASON_LOGOUT_ALL: &str = "logout_all";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Request body for `POST /auth/login`.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    #[validate(length(min = 1, max = 256))]
    pub password: String,
    /// Client label shown in the active sessions list.
    #[validate(length(min = 1, max = 32))]
    pub device: Option<String>,
}

/// Successful login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// Session token; also the `jti` of `access_token`.
    pub session_id: String,
    pub user: UserInfo,
}

/// Public user info embedded in [`LoginResponse`].
#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: DbId,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/auth/login
///
/// Authenticate with username + password. Failures are counted per
/// `(ip, username)`; exhausting the window locks the account.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    input.validate()?;
    let ip = client_ip(&headers);
    let guard = &state.login_guard;

    // 1. Unknown and deactivated accounts fail the same way as a bad password,
    //    including the lock once their quota runs out.
    let user = match UserRepo::find_by_username(&state.pool, &input.username).await? {
        Some(user) if user.is_active => user,
        _ => {
            guard.ensure_unlocked(&input.username, None).await?;
            return Err(guard.record_failure(&ip, &input.username, None).await.into());
        }
    };

    // 2. A locked account is rejected before the password is looked at.
    guard.ensure_unlocked(&input.username, Some(user.id)).await?;

    // 3. Verify password.
    let password_valid = verify_password(&input.password, &user.password_hash)
        .map_err(|e| AppError::InternalError(format!("Password verification error: {e}")))?;
    if !password_valid {
        return Err(guard
            .record_failure(&ip, &input.username, Some(user.id))
            .await
            .into());
    }
    guard.record_success(&ip, &input.username).await;

    // 4. Issue the token; its jti is the session token.
    let roles = UserRepo::role_names(&state.pool, user.id).await?;
    let permissions = UserRepo::permission_names(&state.pool, user.id).await?;
    let (access_token, claims) = generate_access_token(
        user.id,
        roles.clone(),
        permissions.clone(),
        input.device.clone(),
        &state.config.jwt,
    )
    .map_err(|e| AppError::InternalError(format!("Token generation error: {e}")))?;
    let expires_at = DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| AppError::InternalError("Token expiry out of range".into()))?;

    // 5. Persist the durable row, then cache the session.
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let row = SessionRepo::create(
        &state.pool,
        &CreateSession {
            user_id: user.id,
            session_token: claims.jti.clone(),
            refresh_token_hash: None,
            device: input.device.clone(),
            ip_address: Some(ip.clone()),
            user_agent: user_agent.clone(),
            expires_at,
        },
    )
    .await?;

    let mut record = SessionRecord::new(user.id, claims.jti.clone(), expires_at)
        .with_roles(roles.clone(), permissions.clone());
    record.durable_id = Some(row.id);
    record.device = input.device;
    record.ip_address = Some(ip);
    record.user_agent = user_agent;

    let expires_in = state.config.jwt.expires_in_secs();
    let ttl = Duration::from_secs(u64::try_from(expires_in).unwrap_or(0));
    if let Err(e) = state.realtime.sessions.create(&record, ttl).await {
        // Lookups fall back to the durable row.
        tracing::warn!(user_id = user.id, error = %e, "Session not cached at login");
    }

    UserRepo::record_successful_login(&state.pool, user.id).await?;
    tracing::info!(user_id = user.id, session_id = %row.id, "User logged in");

    Ok(Json(LoginResponse {
        access_token,
        expires_in,
        session_id: claims.jti,
        user: UserInfo {
            id: user.id,
            username: user.username,
            email: user.email,
            roles,
            permissions,
        },
    }))
}

/// POST /api/v1/auth/logout
///
/// Revoke the presented session: blacklist its token for the rest of its
/// lifetime, invalidate it, and close its live connections. 204 No Content.
pub async fn logout(State(state): State<AppState>, user: AuthUser) -> AppResult<StatusCode> {
    let remaining = remaining_until(user.expires_at).unwrap_or_default();
    let closed = state
        .realtime
        .revoke_session(user.user_id, &user.session_token, remaining, REASON_LOGOUT)
        .await?;
    tracing::info!(user_id = user.user_id, closed, "User logged out");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/auth/logout-all
///
/// Invalidate every session of the caller and close all their connections.
pub async fn logout_all(State(state): State<AppState>, user: AuthUser) -> AppResult<StatusCode> {
    let remaining = remaining_until(user.expires_at).unwrap_or_default();
    state
        .realtime
        .sessions
        .blacklist(&user.session_token, remaining)
        .await?;
    let closed = state
        .realtime
        .revoke_all(user.user_id, REASON_LOGOUT_ALL)
        .await?;
    tracing::info!(user_id = user.user_id, closed, "User logged out everywhere");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Best-effort client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, else `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
