//! The volatile cache tier.
//!
//! [`VolatileStore`] is the small key/value surface that the session store
//! and rate limiter need: string values, per-key TTLs, atomic increment and
//! glob-style key scans. [`MemoryStore`] is the in-process implementation.
//! It expires keys lazily on access against `tokio::time::Instant`, so
//! tests can drive expiry with a paused clock. Keys that are never read
//! again are reclaimed by the sampling sweeper started with
//! [`MemoryStore::spawn_expiry`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use wildmatch::WildMatch;

/// Interval between active expiry cycles.
const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Expired keys removed per sample. A full sample means more are likely
/// waiting, so the cycle samples again.
const EXPIRY_SAMPLE_SIZE: usize = 20;

/// Failure of the cache tier.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

/// Key/value store with per-key TTL. Implementations must make each call
/// atomic with respect to its key.
#[async_trait]
pub trait VolatileStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` to `value`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment the integer at `key` (absent counts as 0). Keeps any TTL.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set a TTL on an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// All live keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`VolatileStore`] backed by a sharded concurrent map.
///
/// Expired keys are dropped when touched, and by the expiry sweeper when
/// one is running.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet touched.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Start the background sweeper for keys that are never read again.
    /// It stops when `cancel` fires.
    pub fn spawn_expiry(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(ExpiryManager::new(Arc::clone(self)).run(cancel))
    }

    fn live(&self, key: &str, now: Instant) -> Option<Entry> {
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Remove up to `limit` expired keys, returning how many went.
    fn purge_expired_sample(&self, limit: usize) -> usize {
        let now = Instant::now();
        let sample: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .take(limit)
            .map(|e| e.key().clone())
            .collect();
        sample
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(key.as_str(), |_, e| e.is_expired(now))
                    .is_some()
            })
            .count()
    }
}

/// Actively expires keys so that entries nobody reads again (blacklist
/// entries, abandoned rate limit counters) do not pile up.
struct ExpiryManager {
    store: Arc<MemoryStore>,
}

impl ExpiryManager {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = EXPIRY_CHECK_INTERVAL.as_millis() as u64,
            "Cache expiry manager started"
        );
        let mut interval = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cache expiry manager stopping");
                    return;
                }
                _ = interval.tick() => self.purge_cycle().await,
            }
        }
    }

    /// Sample and delete expired keys until a sample comes back short.
    async fn purge_cycle(&self) {
        let mut purged = 0;
        loop {
            let removed = self.store.purge_expired_sample(EXPIRY_SAMPLE_SIZE);
            purged += removed;
            if removed < EXPIRY_SAMPLE_SIZE {
                break;
            }
            tokio::task::yield_now().await;
        }
        if purged > 0 {
            tracing::debug!(purged, "Purged expired cache keys");
        }
    }
}

#[async_trait]
impl VolatileStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live(key, Instant::now()).map(|e| e.value))
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        Ok(match self.live(key, now) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key, Instant::now()).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    };
                    return Ok(1);
                }
                let current: i64 = entry.value.parse().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let matcher = WildMatch::new(pattern);
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
