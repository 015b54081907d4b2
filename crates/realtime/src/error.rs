//! Error taxonomy for authentication and session operations.

use std::time::Duration;

use ussdhub_core::directory::DirectoryError;

use crate::store::StoreError;

/// Why an authentication or session operation failed.
///
/// Callers outside the core must not expose the variant to end users: every
/// authentication failure is reported as a generic rejection.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Malformed, expired, or unverifiable credential.
    #[error("invalid token")]
    InvalidToken,

    /// Username/password (or OTP) did not match.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The token's session id is on the blacklist.
    #[error("token revoked")]
    TokenRevoked,

    /// No usable session for the token. The credential itself may be fine.
    #[error("session not found")]
    SessionNotFound,

    /// The stored session belongs to a different identity.
    #[error("session identity mismatch")]
    IdentityMismatch,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("account locked")]
    AccountLocked { remaining: Option<Duration> },

    /// A TTL or lifetime argument was zero.
    #[error("expired input: ttl must be positive")]
    ExpiredInput,

    /// A backing store failed on a path with no fallback.
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Store(err.to_string())
    }
}

impl From<DirectoryError> for AuthError {
    fn from(err: DirectoryError) -> Self {
        AuthError::Store(err.to_string())
    }
}
