use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;
use ussdhub_core::error::CoreError;
use ussdhub_realtime::hub::HubError;
use ussdhub_realtime::AuthError;

/// Generic message for every credential or session rejection. Callers must
/// not learn whether a token was revoked, unknown or malformed.
const UNAUTHORIZED_MESSAGE: &str = "Invalid or expired token";

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `ussdhub_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An authentication, session or rate limit failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The realtime hub task has stopped.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request body failed field validation.
    #[error("Validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut retry_after = None;

        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
                }
                CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            },

            // --- Authentication ---
            AppError::Auth(auth) => match auth {
                AuthError::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    "Invalid username or password".to_string(),
                ),
                AuthError::InvalidToken
                | AuthError::TokenRevoked
                | AuthError::SessionNotFound
                | AuthError::IdentityMismatch
                | AuthError::ExpiredInput => (
                    StatusCode::UNAUTHORIZED,
                    "UNAUTHORIZED",
                    UNAUTHORIZED_MESSAGE.to_string(),
                ),
                AuthError::RateLimited { retry_after: wait } => {
                    retry_after = *wait;
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        "RATE_LIMITED",
                        "Too many attempts. Try again later.".to_string(),
                    )
                }
                AuthError::AccountLocked { remaining } => {
                    retry_after = *remaining;
                    (
                        StatusCode::LOCKED,
                        "ACCOUNT_LOCKED",
                        "Account is temporarily locked. Try again later.".to_string(),
                    )
                }
                AuthError::Store(msg) => {
                    tracing::error!(error = %msg, "Session store unavailable");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "SERVICE_UNAVAILABLE",
                        "Service temporarily unavailable".to_string(),
                    )
                }
            },

            AppError::Hub(err) => {
                tracing::error!(error = %err, "Realtime hub unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Realtime service unavailable".to_string(),
                )
            }

            // --- Database errors ---
            AppError::Database(err) => classify_sqlx_error(err),

            // --- HTTP-specific errors ---
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                errors.to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(value) = retry_after.and_then(retry_after_header) {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

/// Whole seconds, rounded up so clients never retry early.
fn retry_after_header(wait: Duration) -> Option<HeaderValue> {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    HeaderValue::from_str(&secs.max(1).to_string()).ok()
}

/// Classify a sqlx error into an HTTP status, error code, and message.
///
/// - `RowNotFound` maps to 404.
/// - Unique constraint violations (constraint name starting with `uq_`) map to 409.
/// - Everything else maps to 500 with a sanitized message.
fn classify_sqlx_error(err: &sqlx::Error) -> (StatusCode, &'static str, String) {
    match err {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        sqlx::Error::Database(db_err) => {
            // PostgreSQL unique constraint violation: error code 23505
            if db_err.code().as_deref() == Some("23505") {
                let constraint = db_err.constraint().unwrap_or("unknown");
                if constraint.starts_with("uq_") {
                    return (
                        StatusCode::CONFLICT,
                        "CONFLICT",
                        format!("Duplicate value violates unique constraint: {constraint}"),
                    );
                }
            }
            tracing::error!(error = %db_err, "Database error");
            internal()
        }
        other => {
            tracing::error!(error = %other, "Database error");
            internal()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoked_and_unknown_sessions_look_identical() {
        let revoked = AppError::Auth(AuthError::TokenRevoked).into_response();
        let missing = AppError::Auth(AuthError::SessionNotFound).into_response();
        assert_eq!(revoked.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = AppError::Auth(AuthError::RateLimited {
            retry_after: Some(Duration::from_millis(90_500)),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "91");
    }

    #[test]
    fn lock_maps_to_423() {
        let response = AppError::Auth(AuthError::AccountLocked {
            remaining: Some(Duration::from_secs(1800)),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(response.headers()[RETRY_AFTER], "1800");
    }

    #[test]
    fn store_outage_is_503_without_detail() {
        let response = AppError::Auth(AuthError::Store("cache unreachable".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }
}
