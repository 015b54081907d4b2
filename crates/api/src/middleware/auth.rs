//! Bearer-token authentication extractor for Axum handlers.
//!
//! The token must verify, must not be blacklisted and must map to a live
//! session, so a logged-out token is rejected even before it expires.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use ussdhub_core::error::CoreError;
use ussdhub_core::types::{DbId, Timestamp};

use crate::error::AppError;
use crate::state::AppState;

/// Authenticated user extracted from a Bearer token.
///
/// ```ignore
/// async fn my_handler(user: AuthUser) -> AppResult<Json<()>> {
///     tracing::info!(user_id = user.user_id, "handling request");
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The user's internal database id (from `claims.sub`).
    pub user_id: DbId,
    /// Session token (`claims.jti`) of the presented credential.
    pub session_token: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    /// When the presented credential expires.
    pub expires_at: Timestamp,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = header_bearer(&parts.headers)?;
        let session = state.realtime.authenticator.authenticate(token).await?;

        Ok(AuthUser {
            user_id: session.identity_id(),
            session_token: session.token.session_token,
            roles: session.session.roles,
            permissions: session.session.permissions,
            expires_at: session.token.expires_at,
        })
    }
}

/// Token from `Authorization: Bearer <token>`.
pub fn header_bearer(headers: &HeaderMap) -> Result<&str, AppError> {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Core(CoreError::Unauthorized(
                "Missing Authorization header".into(),
            ))
        })?;

    auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        AppError::Core(CoreError::Unauthorized(
            "Invalid Authorization format. Expected: Bearer <token>".into(),
        ))
    })
}
