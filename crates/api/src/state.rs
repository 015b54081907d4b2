use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ussdhub_db::directory::PgSessionDirectory;
use ussdhub_realtime::handlers::{HandlerRegistry, NotificationAckHandler, TYPE_NOTIFICATION_READ};
use ussdhub_realtime::rate_limit::{LoginGuard, RateLimiter};
use ussdhub_realtime::store::MemoryStore;
use ussdhub_realtime::Realtime;

use crate::auth::jwt::JwtVerifier;
use crate::config::ServerConfig;
use crate::notifications::PgNotificationInbox;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is an `Arc` or a handle.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: ussdhub_db::DbPool,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Session store, authenticator and connection hub.
    pub realtime: Realtime,
    /// Failed-login accounting and account locks.
    pub login_guard: LoginGuard,
    /// Generic fixed-window quotas (admin broadcast, etc).
    pub limiter: RateLimiter,
}

impl AppState {
    /// Start the realtime context over Postgres and the in-process cache,
    /// then build state around it. Spawns the hub task and the cache expiry
    /// sweeper, which runs until `background` is cancelled.
    pub fn start(
        pool: ussdhub_db::DbPool,
        config: ServerConfig,
        background: CancellationToken,
    ) -> Self {
        let handlers = HandlerRegistry::builder()
            .register(
                TYPE_NOTIFICATION_READ,
                Arc::new(NotificationAckHandler::new(Arc::new(PgNotificationInbox::new(
                    pool.clone(),
                )))),
            )
            .build();

        let cache = Arc::new(MemoryStore::new());
        cache.spawn_expiry(background);

        let realtime = Realtime::start(
            config.realtime.clone(),
            cache,
            Arc::new(PgSessionDirectory::new(pool.clone())),
            Arc::new(JwtVerifier::new(config.jwt.clone())),
            handlers,
        );
        Self::new(pool, config, realtime)
    }

    /// Build state over an already started [`Realtime`] context. Rate limit
    /// counters share the realtime cache.
    pub fn new(pool: ussdhub_db::DbPool, config: ServerConfig, realtime: Realtime) -> Self {
        let limiter = RateLimiter::new(Arc::clone(&realtime.cache));
        let login_guard = LoginGuard::new(limiter.clone(), Arc::new(config.rate_limit.clone()));
        Self {
            pool,
            config: Arc::new(config),
            realtime,
            login_guard,
            limiter,
        }
    }
}
