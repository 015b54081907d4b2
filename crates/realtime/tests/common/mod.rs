//! Shared fakes for the realtime integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use ussdhub_core::directory::{
    DirectoryError, Identity, NewSession, SessionDirectory, StoredSession,
};
use ussdhub_core::types::DbId;
use ussdhub_realtime::auth::{TokenVerifier, VerifiedToken};
use ussdhub_realtime::config::RealtimeConfig;
use ussdhub_realtime::envelope::Frame;
use ussdhub_realtime::handlers::HandlerRegistry;
use ussdhub_realtime::session::SessionRecord;
use ussdhub_realtime::store::{KeyTtl, MemoryStore, StoreError, VolatileStore};
use ussdhub_realtime::{AuthError, Realtime};

// ---------------------------------------------------------------------------
// Session directory
// ---------------------------------------------------------------------------

/// In-memory stand-in for the relational session directory.
#[derive(Default)]
pub struct FakeDirectory {
    sessions: Mutex<Vec<StoredSession>>,
    identities: Mutex<HashMap<DbId, Identity>>,
    next_id: AtomicI64,
    pub failing: AtomicBool,
    pub activity_updates: AtomicI64,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_identity(&self, id: DbId, roles: &[&str], permissions: &[&str]) {
        self.identities.lock().unwrap().insert(
            id,
            Identity {
                id,
                username: format!("user{id}"),
                is_active: true,
                roles: roles.iter().map(|s| s.to_string()).collect(),
                permissions: permissions.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// Insert an active row expiring in an hour. Returns its id.
    pub fn add_session(&self, identity_id: DbId, token: &str) -> DbId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        self.sessions.lock().unwrap().push(StoredSession {
            id,
            identity_id,
            session_token: token.to_string(),
            refresh_token_hash: None,
            device: Some("web".into()),
            ip_address: Some("10.0.0.1".into()),
            user_agent: None,
            is_active: true,
            last_activity_at: now,
            expires_at: now + chrono::Duration::hours(1),
            created_at: now,
        });
        id
    }

    pub fn is_active(&self, token: &str) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.session_token == token && s.is_active)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DirectoryError("database is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SessionDirectory for FakeDirectory {
    async fn find_session_by_token(
        &self,
        token: &str,
    ) -> Result<Option<StoredSession>, DirectoryError> {
        self.check()?;
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.session_token == token)
            .cloned())
    }

    async fn find_active_sessions(
        &self,
        identity_id: DbId,
    ) -> Result<Vec<StoredSession>, DirectoryError> {
        self.check()?;
        let now = Utc::now();
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.identity_id == identity_id && s.is_active && s.expires_at > now)
            .cloned()
            .collect())
    }

    async fn create_session(&self, input: &NewSession) -> Result<StoredSession, DirectoryError> {
        self.check()?;
        let id = self.add_session(input.identity_id, &input.session_token);
        let sessions = self.sessions.lock().unwrap();
        let row = sessions.iter().find(|s| s.id == id).cloned();
        row.ok_or_else(|| DirectoryError("row vanished".into()))
    }

    async fn invalidate_session(&self, id: DbId) -> Result<bool, DirectoryError> {
        self.check()?;
        let mut sessions = self.sessions.lock().unwrap();
        Ok(sessions
            .iter_mut()
            .find(|s| s.id == id && s.is_active)
            .map(|s| s.is_active = false)
            .is_some())
    }

    async fn invalidate_all_sessions(&self, identity_id: DbId) -> Result<u64, DirectoryError> {
        self.check()?;
        let mut changed = 0;
        for s in self.sessions.lock().unwrap().iter_mut() {
            if s.identity_id == identity_id && s.is_active {
                s.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_session_activity(&self, _id: DbId) -> Result<(), DirectoryError> {
        self.check()?;
        self.activity_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_identity_by_id(&self, id: DbId) -> Result<Option<Identity>, DirectoryError> {
        self.check()?;
        Ok(self.identities.lock().unwrap().get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Volatile store with an outage switch
// ---------------------------------------------------------------------------

/// [`MemoryStore`] that can be switched off to simulate a cache outage.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VolatileStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        self.check()?;
        self.inner.ttl(key).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.del(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        self.check()?;
        self.inner.incr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.expire(key, ttl).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.scan(pattern).await
    }
}

// ---------------------------------------------------------------------------
// Token verifier
// ---------------------------------------------------------------------------

/// Accepts bearer strings issued through [`FakeVerifier::issue`].
#[derive(Default)]
pub struct FakeVerifier {
    tokens: Mutex<HashMap<String, VerifiedToken>>,
}

impl FakeVerifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue a bearer whose `jti` is `token`. The bearer string is
    /// `bearer-{token}`.
    pub fn issue(&self, identity_id: DbId, token: &str, roles: &[&str], permissions: &[&str]) -> String {
        let bearer = format!("bearer-{token}");
        self.tokens.lock().unwrap().insert(
            bearer.clone(),
            VerifiedToken {
                identity_id,
                session_token: token.to_string(),
                roles: roles.iter().map(|s| s.to_string()).collect(),
                permissions: permissions.iter().map(|s| s.to_string()).collect(),
                device: Some("test".into()),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        );
        bearer
    }
}

impl TokenVerifier for FakeVerifier {
    fn verify(&self, bearer: &str) -> Result<VerifiedToken, AuthError> {
        self.tokens
            .lock()
            .unwrap()
            .get(bearer)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub realtime: Realtime,
    pub cache: Arc<FlakyStore>,
    pub directory: Arc<FakeDirectory>,
    pub verifier: Arc<FakeVerifier>,
}

pub fn harness() -> Harness {
    harness_with(RealtimeConfig::default(), HandlerRegistry::default())
}

pub fn harness_with(config: RealtimeConfig, handlers: HandlerRegistry) -> Harness {
    let cache = FlakyStore::new();
    let directory = FakeDirectory::new();
    let verifier = FakeVerifier::new();
    let realtime = Realtime::start(
        config,
        cache.clone(),
        directory.clone(),
        verifier.clone(),
        handlers,
    );
    Harness {
        realtime,
        cache,
        directory,
        verifier,
    }
}

impl Harness {
    /// Cache a session for `identity_id`/`token` and return a bearer for it.
    pub async fn login(
        &self,
        identity_id: DbId,
        token: &str,
        roles: &[&str],
        permissions: &[&str],
    ) -> String {
        let role_list: Vec<String> = roles.iter().map(|s| s.to_string()).collect();
        let perm_list: Vec<String> = permissions.iter().map(|s| s.to_string()).collect();
        let record = SessionRecord::new(identity_id, token, Utc::now() + chrono::Duration::hours(1))
            .with_roles(role_list, perm_list);
        self.realtime
            .sessions
            .create(&record, Duration::from_secs(3600))
            .await
            .unwrap();
        self.verifier.issue(identity_id, token, roles, permissions)
    }

    /// Authenticate `bearer` and run a connection over in-memory channels.
    pub async fn connect(&self, bearer: &str) -> TestClient {
        let auth = self.realtime.authenticator.authenticate(bearer).await.unwrap();

        let (out_tx, out_rx) = fmpsc::unbounded::<Frame>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Frame, String>>();
        let realtime = self.realtime.clone();
        let task = tokio::spawn(ussdhub_realtime::client::serve(out_tx, in_rx, auth, realtime));

        TestClient {
            inbound: in_tx,
            outbound: out_rx,
            task,
        }
    }
}

/// The peer end of a connection under test.
pub struct TestClient {
    pub inbound: fmpsc::UnboundedSender<Result<Frame, String>>,
    pub outbound: fmpsc::UnboundedReceiver<Frame>,
    pub task: JoinHandle<()>,
}

impl TestClient {
    pub fn send_text(&self, text: &str) {
        self.inbound
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .unwrap();
    }

    pub fn send_frame(&self, frame: Frame) {
        self.inbound.unbounded_send(Ok(frame)).unwrap();
    }

    /// Next frame from the server, or `None` if nothing arrives within 5s.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.next())
            .await
            .ok()
            .flatten()
    }

    /// Next JSON event, skipping keepalive pings.
    pub async fn next_event(&mut self) -> Value {
        loop {
            match self.next_frame().await {
                Some(Frame::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(Frame::Ping(_)) => continue,
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }
}
