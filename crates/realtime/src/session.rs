//! Dual-tier session store.
//!
//! The volatile cache decides whether a session is currently valid; the
//! [`SessionDirectory`] is the system of record and the recovery path when
//! the cache is cold. Reads go cache-first and repair the cache from the
//! directory on a miss. Nothing sweeps expired sessions: cache TTLs do.
//!
//! Key layout:
//!
//! ```text
//! session:{identity}:{token}   serialized SessionRecord, TTL = session lifetime
//! blacklist:{token}            "1", TTL = remaining lifetime of the token
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ussdhub_core::directory::{SessionDirectory, StoredSession};
use ussdhub_core::types::{DbId, Timestamp};

use crate::error::AuthError;
use crate::store::{KeyTtl, VolatileStore};

const SESSION_PREFIX: &str = "session";
const BLACKLIST_PREFIX: &str = "blacklist";

/// Cached view of an authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub identity_id: DbId,
    /// Unique session token (the access token's `jti`).
    pub session_token: String,
    /// Id of the mirrored `user_sessions` row, when known.
    #[serde(default)]
    pub durable_id: Option<DbId>,
    #[serde(default)]
    pub refresh_token_hash: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub login_at: Timestamp,
    pub last_activity_at: Timestamp,
    pub expires_at: Timestamp,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionRecord {
    /// A fresh, active record with no device metadata.
    pub fn new(identity_id: DbId, session_token: impl Into<String>, expires_at: Timestamp) -> Self {
        let now = Utc::now();
        Self {
            identity_id,
            session_token: session_token.into(),
            durable_id: None,
            refresh_token_hash: None,
            device: None,
            ip_address: None,
            user_agent: None,
            roles: Vec::new(),
            permissions: Vec::new(),
            login_at: now,
            last_activity_at: now,
            expires_at,
            is_active: true,
            metadata: Map::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>, permissions: Vec<String>) -> Self {
        self.roles = roles;
        self.permissions = permissions;
        self
    }

    /// Time until `expires_at`, or `None` once it has passed.
    pub fn remaining_lifetime(&self) -> Option<Duration> {
        remaining_until(self.expires_at)
    }
}

/// Time from now until `at`, or `None` if `at` is not in the future.
pub fn remaining_until(at: Timestamp) -> Option<Duration> {
    (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}

fn session_key(identity_id: DbId, token: &str) -> String {
    format!("{SESSION_PREFIX}:{identity_id}:{token}")
}

fn session_pattern(identity_id: DbId) -> String {
    format!("{SESSION_PREFIX}:{identity_id}:*")
}

fn token_from_key(identity_id: DbId, key: &str) -> Option<&str> {
    key.strip_prefix(&format!("{SESSION_PREFIX}:{identity_id}:"))
}

fn blacklist_key(token: &str) -> String {
    format!("{BLACKLIST_PREFIX}:{token}")
}

/// Cache-aside session store over a [`VolatileStore`] and a [`SessionDirectory`].
pub struct SessionStore {
    cache: Arc<dyn VolatileStore>,
    directory: Arc<dyn SessionDirectory>,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn VolatileStore>, directory: Arc<dyn SessionDirectory>) -> Self {
        Self { cache, directory }
    }

    /// Cache a new session for `ttl`.
    ///
    /// The durable row's activity marker is bumped in a detached task whose
    /// failure is only logged.
    pub async fn create(&self, record: &SessionRecord, ttl: Duration) -> Result<(), AuthError> {
        if ttl.is_zero() {
            return Err(AuthError::ExpiredInput);
        }

        let key = session_key(record.identity_id, &record.session_token);
        let raw = encode(record)?;
        self.cache.set(&key, raw, Some(ttl)).await?;

        tracing::debug!(
            identity_id = record.identity_id,
            ttl_secs = ttl.as_secs(),
            "Session cached"
        );

        if let Some(durable_id) = record.durable_id {
            let directory = Arc::clone(&self.directory);
            tokio::spawn(async move {
                if let Err(e) = directory.update_session_activity(durable_id).await {
                    tracing::warn!(session_id = durable_id, error = %e, "Failed to update session activity");
                }
            });
        }

        Ok(())
    }

    /// Look up a session, touching its last-activity timestamp.
    ///
    /// Falls back to the directory when the cache misses or is unavailable,
    /// then re-warms the cache in a detached task.
    pub async fn get(&self, identity_id: DbId, token: &str) -> Result<SessionRecord, AuthError> {
        let key = session_key(identity_id, token);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(mut record) => {
                    if record.identity_id != identity_id {
                        return Err(AuthError::IdentityMismatch);
                    }
                    record.last_activity_at = Utc::now();
                    self.rewrite_keep_ttl(&key, &record).await;
                    return Ok(record);
                }
                Err(e) => {
                    tracing::warn!(identity_id, error = %e, "Corrupt cached session, reloading");
                }
            },
            Ok(None) => {
                tracing::debug!(identity_id, "Session cache miss");
            }
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "Session cache unavailable, using directory");
            }
        }

        self.load_from_directory(identity_id, token).await
    }

    /// Bump `last_activity_at` while keeping the remaining TTL.
    ///
    /// An absent record is treated as natural expiry, not an error.
    pub async fn touch(&self, identity_id: DbId, token: &str) -> Result<(), AuthError> {
        let key = session_key(identity_id, token);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(());
        };
        let mut record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "Corrupt cached session on touch");
                return Ok(());
            }
        };
        record.last_activity_at = Utc::now();
        if let KeyTtl::Expires(remaining) = self.cache.ttl(&key).await? {
            self.cache.set(&key, encode(&record)?, Some(remaining)).await?;
        }
        Ok(())
    }

    /// Drop one session from the cache and mark its durable row inactive.
    pub async fn invalidate(&self, identity_id: DbId, token: &str) -> Result<(), AuthError> {
        let key = session_key(identity_id, token);
        if let Err(e) = self.cache.del(&[key]).await {
            tracing::warn!(identity_id, error = %e, "Failed to delete cached session, TTL will clear it");
        }

        if let Some(row) = self.directory.find_session_by_token(token).await? {
            if row.identity_id == identity_id {
                self.directory.invalidate_session(row.id).await?;
            } else {
                tracing::warn!(identity_id, "Refusing to invalidate session of another identity");
            }
        }

        tracing::info!(identity_id, "Session invalidated");
        Ok(())
    }

    /// Drop every session of an identity. Returns the number of cache
    /// entries removed.
    ///
    /// Every token known to either tier is blacklisted for the rest of its
    /// lifetime first, so a cache warm-up still in flight cannot bring one
    /// of them back.
    pub async fn invalidate_all(&self, identity_id: DbId) -> Result<u64, AuthError> {
        let rows = self.directory.find_active_sessions(identity_id).await?;
        let keys = match self.cache.scan(&session_pattern(identity_id)).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "Failed to scan cached sessions");
                Vec::new()
            }
        };

        let mut tokens: HashMap<String, Duration> = HashMap::new();
        for row in rows {
            if let Some(remaining) = remaining_until(row.expires_at) {
                tokens.insert(row.session_token, remaining);
            }
        }
        for key in &keys {
            let Some(token) = token_from_key(identity_id, key) else {
                continue;
            };
            if let Ok(KeyTtl::Expires(remaining)) = self.cache.ttl(key).await {
                let entry = tokens.entry(token.to_string()).or_default();
                *entry = (*entry).max(remaining);
            }
        }
        for (token, remaining) in &tokens {
            if let Err(e) = self.blacklist(token, *remaining).await {
                tracing::warn!(identity_id, error = %e, "Failed to blacklist session token");
            }
        }

        let removed = if keys.is_empty() {
            0
        } else {
            self.cache.del(&keys).await.unwrap_or_else(|e| {
                tracing::warn!(identity_id, error = %e, "Failed to delete cached sessions");
                0
            })
        };

        let rows = self.directory.invalidate_all_sessions(identity_id).await?;
        tracing::info!(
            identity_id,
            cached = removed,
            rows,
            blacklisted = tokens.len(),
            "All sessions invalidated"
        );
        Ok(removed)
    }

    /// Blacklist a token for `ttl`, which must be the token's remaining
    /// lifetime. A zero `ttl` means the token is already dead and nothing
    /// is written.
    pub async fn blacklist(&self, token: &str, ttl: Duration) -> Result<(), AuthError> {
        if ttl.is_zero() {
            tracing::debug!("Token already expired, skipping blacklist entry");
            return Ok(());
        }
        self.cache
            .set(&blacklist_key(token), "1".to_string(), Some(ttl))
            .await?;
        Ok(())
    }

    pub async fn is_blacklisted(&self, token: &str) -> Result<bool, AuthError> {
        Ok(self.cache.exists(&blacklist_key(token)).await?)
    }

    /// Invalidate a session and blacklist its token for `remaining`.
    pub async fn revoke(
        &self,
        identity_id: DbId,
        token: &str,
        remaining: Duration,
    ) -> Result<(), AuthError> {
        self.blacklist(token, remaining).await?;
        self.invalidate(identity_id, token).await
    }

    /// Sessions currently in the cache for an identity.
    ///
    /// Cache only: during a cache outage or after eviction this under-reports.
    pub async fn list_active(&self, identity_id: DbId) -> Result<Vec<SessionRecord>, AuthError> {
        let keys = self.cache.scan(&session_pattern(identity_id)).await?;
        let mut sessions = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.cache.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) if record.is_active => sessions.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping corrupt cached session"),
            }
        }
        sessions.sort_by(|a, b| b.login_at.cmp(&a.login_at));
        Ok(sessions)
    }

    async fn rewrite_keep_ttl(&self, key: &str, record: &SessionRecord) {
        let result = async {
            if let KeyTtl::Expires(remaining) = self.cache.ttl(key).await? {
                self.cache.set(key, encode(record)?, Some(remaining)).await?;
            }
            Ok::<(), AuthError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(identity_id = record.identity_id, error = %e, "Failed to touch session");
        }
    }

    async fn load_from_directory(
        &self,
        identity_id: DbId,
        token: &str,
    ) -> Result<SessionRecord, AuthError> {
        let stored = match self.directory.find_session_by_token(token).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return Err(AuthError::SessionNotFound),
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "Session directory lookup failed");
                return Err(AuthError::SessionNotFound);
            }
        };

        if stored.identity_id != identity_id {
            tracing::warn!(
                identity_id,
                stored_identity_id = stored.identity_id,
                "Session belongs to another identity"
            );
            return Err(AuthError::IdentityMismatch);
        }
        if !stored.is_active {
            return Err(AuthError::SessionNotFound);
        }
        let remaining = remaining_until(stored.expires_at).ok_or(AuthError::SessionNotFound)?;

        let identity = match self.directory.find_identity_by_id(identity_id).await {
            Ok(Some(identity)) if identity.is_active => identity,
            Ok(_) => return Err(AuthError::SessionNotFound),
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "Identity lookup failed");
                return Err(AuthError::SessionNotFound);
            }
        };

        let record = record_from_stored(stored, identity.roles, identity.permissions);
        self.warm_cache(record.clone(), remaining);
        Ok(record)
    }

    fn warm_cache(&self, record: SessionRecord, ttl: Duration) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            let key = session_key(record.identity_id, &record.session_token);
            let result = match encode(&record) {
                Ok(raw) => cache.set(&key, raw, Some(ttl)).await.map_err(AuthError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => tracing::debug!(identity_id = record.identity_id, "Session cache warmed"),
                Err(e) => {
                    tracing::warn!(identity_id = record.identity_id, error = %e, "Session cache warm-up failed")
                }
            }
        });
    }
}

fn record_from_stored(
    stored: StoredSession,
    roles: Vec<String>,
    permissions: Vec<String>,
) -> SessionRecord {
    let mut metadata = Map::new();
    metadata.insert("restored_from".into(), Value::String("directory".into()));
    SessionRecord {
        identity_id: stored.identity_id,
        session_token: stored.session_token,
        durable_id: Some(stored.id),
        refresh_token_hash: stored.refresh_token_hash,
        device: stored.device,
        ip_address: stored.ip_address,
        user_agent: stored.user_agent,
        roles,
        permissions,
        login_at: stored.created_at,
        last_activity_at: Utc::now(),
        expires_at: stored.expires_at,
        is_active: true,
        metadata,
    }
}

fn encode(record: &SessionRecord) -> Result<String, AuthError> {
    serde_json::to_string(record).map_err(|e| AuthError::Store(e.to_string()))
}
