//! Fixed-window rate limiting and account locks on the volatile store.
//!
//! A counter's window starts at the increment that creates the key and ends
//! when the key's TTL runs out; there is no sliding behaviour.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ussdhub_core::types::DbId;

use crate::config::{Quota, RateLimitConfig};
use crate::error::AuthError;
use crate::store::{KeyTtl, StoreError, VolatileStore};

/// What a counter is limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Login,
    PasswordReset,
    Otp,
    Api,
}

impl RateLimitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::Login => "login",
            RateLimitScope::PasswordReset => "password_reset",
            RateLimitScope::Otp => "otp",
            RateLimitScope::Api => "api",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`RateLimiter::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Attempts left in the current window.
    pub remaining: u32,
    /// Count after this increment.
    pub count: i64,
}

/// Whether an identity is locked and for how much longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    pub locked: bool,
    pub remaining: Option<Duration>,
}

fn counter_key(scope: RateLimitScope, subject: &str) -> String {
    format!("ratelimit:{scope}:{subject}")
}

fn lock_key(identity_id: DbId) -> String {
    format!("lock:account:{identity_id}")
}

fn username_lock_key(username: &str) -> String {
    format!("lock:login:{username}")
}

/// Fixed-window counters plus account locks.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn VolatileStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn VolatileStore>) -> Self {
        Self { store }
    }

    /// Count one event for `(scope, subject)`.
    ///
    /// The window TTL is applied only when this call created the counter.
    /// `allowed` is `count <= limit`.
    pub async fn check_and_increment(
        &self,
        scope: RateLimitScope,
        subject: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, StoreError> {
        let key = counter_key(scope, subject);
        let count = self.store.incr(&key).await?;
        if count == 1 {
            self.store.expire(&key, window).await?;
        }

        let allowed = count <= i64::from(limit);
        let remaining = u32::try_from(i64::from(limit) - count).unwrap_or(0);
        if !allowed {
            tracing::debug!(scope = %scope, subject, count, limit, "Rate limit exceeded");
        }
        Ok(RateDecision {
            allowed,
            remaining,
            count,
        })
    }

    /// [`check_and_increment`](Self::check_and_increment) against a [`Quota`].
    pub async fn check_quota(
        &self,
        scope: RateLimitScope,
        subject: &str,
        quota: Quota,
    ) -> Result<RateDecision, StoreError> {
        self.check_and_increment(scope, subject, quota.limit, quota.window)
            .await
    }

    /// Time left in the current window, if a counter exists.
    pub async fn window_remaining(
        &self,
        scope: RateLimitScope,
        subject: &str,
    ) -> Result<Option<Duration>, StoreError> {
        Ok(match self.store.ttl(&counter_key(scope, subject)).await? {
            KeyTtl::Expires(d) => Some(d),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        })
    }

    /// Delete a counter, e.g. after a successful login.
    pub async fn reset(&self, scope: RateLimitScope, subject: &str) -> Result<(), StoreError> {
        self.store.del(&[counter_key(scope, subject)]).await?;
        Ok(())
    }

    pub async fn lock(&self, identity_id: DbId, duration: Duration) -> Result<(), StoreError> {
        self.set_lock(&lock_key(identity_id), duration).await?;
        tracing::warn!(identity_id, lock_secs = duration.as_secs(), "Account locked");
        Ok(())
    }

    pub async fn unlock(&self, identity_id: DbId) -> Result<(), StoreError> {
        self.store.del(&[lock_key(identity_id)]).await?;
        tracing::info!(identity_id, "Account unlocked");
        Ok(())
    }

    pub async fn is_locked(&self, identity_id: DbId) -> Result<LockStatus, StoreError> {
        self.lock_status(&lock_key(identity_id)).await
    }

    async fn set_lock(&self, key: &str, duration: Duration) -> Result<(), StoreError> {
        self.store.set(key, "1".to_string(), Some(duration)).await
    }

    async fn lock_status(&self, key: &str) -> Result<LockStatus, StoreError> {
        Ok(match self.store.ttl(key).await? {
            KeyTtl::Missing => LockStatus {
                locked: false,
                remaining: None,
            },
            KeyTtl::Persistent => LockStatus {
                locked: true,
                remaining: None,
            },
            KeyTtl::Expires(d) => LockStatus {
                locked: true,
                remaining: Some(d),
            },
        })
    }
}

/// Login escalation policy: too many failures for one `(ip, username)` pair
/// within the window locks the account.
#[derive(Clone)]
pub struct LoginGuard {
    limiter: RateLimiter,
    config: Arc<RateLimitConfig>,
}

impl LoginGuard {
    pub fn new(limiter: RateLimiter, config: Arc<RateLimitConfig>) -> Self {
        Self { limiter, config }
    }

    fn subject(ip: &str, username: &str) -> String {
        format!("{ip}:{username}")
    }

    /// Reject up front if the login is locked. Must run before the password
    /// is checked.
    ///
    /// Unknown usernames carry their own lock so that an exhausted quota
    /// looks the same whether or not the account exists.
    pub async fn ensure_unlocked(
        &self,
        username: &str,
        identity_id: Option<DbId>,
    ) -> Result<(), AuthError> {
        let status = match identity_id {
            Some(identity_id) => self.limiter.is_locked(identity_id).await?,
            None => self.limiter.lock_status(&username_lock_key(username)).await?,
        };
        if status.locked {
            return Err(AuthError::AccountLocked {
                remaining: status.remaining,
            });
        }
        Ok(())
    }

    /// Record a credential mismatch.
    ///
    /// Returns the error the caller should surface: `AccountLocked` once the
    /// quota is exhausted, otherwise `InvalidCredentials`.
    pub async fn record_failure(
        &self,
        ip: &str,
        username: &str,
        identity_id: Option<DbId>,
    ) -> AuthError {
        let subject = Self::subject(ip, username);
        let decision = match self
            .limiter
            .check_quota(RateLimitScope::Login, &subject, self.config.login)
            .await
        {
            Ok(decision) => decision,
            Err(e) => return AuthError::from(e),
        };

        if decision.allowed {
            tracing::info!(ip, username, remaining = decision.remaining, "Failed login attempt");
            return AuthError::InvalidCredentials;
        }

        let duration = self.config.lock_duration;
        let locked = match identity_id {
            Some(identity_id) => self.limiter.lock(identity_id, duration).await,
            None => {
                tracing::warn!(ip, username, lock_secs = duration.as_secs(), "Unknown login locked");
                self.limiter
                    .set_lock(&username_lock_key(username), duration)
                    .await
            }
        };
        match locked {
            Ok(()) => AuthError::AccountLocked {
                remaining: Some(duration),
            },
            Err(e) => AuthError::from(e),
        }
    }

    /// Clear the failure counter after a successful login.
    pub async fn record_success(&self, ip: &str, username: &str) {
        if let Err(e) = self
            .limiter
            .reset(RateLimitScope::Login, &Self::subject(ip, username))
            .await
        {
            tracing::warn!(ip, username, error = %e, "Failed to reset login counter");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::store::MemoryStore;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_login_attempt_is_denied() {
        let limiter = limiter();
        for call in 1..=5 {
            let d = limiter
                .check_and_increment(RateLimitScope::Login, "ip:user", 5, WINDOW)
                .await
                .unwrap();
            assert!(d.allowed, "call {call} should be allowed");
            assert_eq!(d.remaining, 5 - call);
        }
        let sixth = limiter
            .check_and_increment(RateLimitScope::Login, "ip:user", 5, WINDOW)
            .await
            .unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.remaining, 0);
        assert_eq!(sixth.count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_restarts_count() {
        let limiter = limiter();
        for _ in 0..7 {
            limiter
                .check_and_increment(RateLimitScope::Otp, "42", 3, Duration::from_secs(60))
                .await
                .unwrap();
        }

        // Later increments must not extend the window set by the first one.
        tokio::time::advance(Duration::from_secs(60)).await;

        let d = limiter
            .check_and_increment(RateLimitScope::Otp, "42", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(d.count, 1);
        assert!(d.allowed);
        assert_eq!(
            limiter
                .window_remaining(RateLimitScope::Otp, "42")
                .await
                .unwrap(),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn scopes_are_independent_and_reset_clears() {
        let limiter = limiter();
        limiter
            .check_and_increment(RateLimitScope::Api, "k", 1, WINDOW)
            .await
            .unwrap();
        let other = limiter
            .check_and_increment(RateLimitScope::PasswordReset, "k", 1, WINDOW)
            .await
            .unwrap();
        assert_eq!(other.count, 1);

        limiter.reset(RateLimitScope::Api, "k").await.unwrap();
        let again = limiter
            .check_and_increment(RateLimitScope::Api, "k", 1, WINDOW)
            .await
            .unwrap();
        assert_eq!(again.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_reports_remaining_and_expires() {
        let limiter = limiter();
        limiter.lock(9, Duration::from_secs(30)).await.unwrap();

        let status = limiter.is_locked(9).await.unwrap();
        assert!(status.locked);
        assert_eq!(status.remaining, Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!limiter.is_locked(9).await.unwrap().locked);
    }

    #[tokio::test]
    async fn unlock_clears_lock() {
        let limiter = limiter();
        limiter.lock(9, Duration::from_secs(30)).await.unwrap();
        limiter.unlock(9).await.unwrap();
        assert!(!limiter.is_locked(9).await.unwrap().locked);
    }

    #[tokio::test]
    async fn guard_locks_known_identity_after_quota() {
        let config = RateLimitConfig {
            login: Quota::new(2, WINDOW),
            ..RateLimitConfig::default()
        };
        let guard = LoginGuard::new(limiter(), Arc::new(config));

        assert_matches!(
            guard.record_failure("1.2.3.4", "amina", Some(5)).await,
            AuthError::InvalidCredentials
        );
        assert_matches!(
            guard.record_failure("1.2.3.4", "amina", Some(5)).await,
            AuthError::InvalidCredentials
        );
        assert_matches!(
            guard.record_failure("1.2.3.4", "amina", Some(5)).await,
            AuthError::AccountLocked { .. }
        );
        assert_matches!(
            guard.ensure_unlocked("amina", Some(5)).await,
            Err(AuthError::AccountLocked { remaining: Some(_) })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn guard_rejects_unknown_and_known_usernames_alike() {
        let config = Arc::new(RateLimitConfig {
            login: Quota::new(1, WINDOW),
            lock_duration: Duration::from_secs(1800),
            ..RateLimitConfig::default()
        });
        let guard = LoginGuard::new(limiter(), config);

        guard.record_failure("ip", "ghost", None).await;
        guard.record_failure("ip", "amina", Some(5)).await;
        let unknown = guard.record_failure("ip", "ghost", None).await;
        let known = guard.record_failure("ip", "amina", Some(5)).await;
        assert_eq!(unknown.to_string(), known.to_string());
        assert_matches!(
            unknown,
            AuthError::AccountLocked { remaining: Some(d) } if d == Duration::from_secs(1800)
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        let unknown = guard.ensure_unlocked("ghost", None).await.unwrap_err();
        let known = guard.ensure_unlocked("amina", Some(5)).await.unwrap_err();
        assert_matches!(
            (unknown, known),
            (
                AuthError::AccountLocked { remaining: Some(a) },
                AuthError::AccountLocked { remaining: Some(b) }
            ) if a == b && a == Duration::from_secs(1740)
        );
    }

    #[tokio::test]
    async fn guard_success_resets_counter() {
        let config = RateLimitConfig {
            login: Quota::new(1, WINDOW),
            ..RateLimitConfig::default()
        };
        let guard = LoginGuard::new(limiter(), Arc::new(config));

        guard.record_failure("ip", "amina", Some(1)).await;
        guard.record_success("ip", "amina").await;
        assert_matches!(
            guard.record_failure("ip", "amina", Some(1)).await,
            AuthError::InvalidCredentials
        );
        assert!(guard.ensure_unlocked("amina", Some(1)).await.is_ok());
    }
}
