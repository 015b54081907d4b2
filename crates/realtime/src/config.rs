//! Tunables for connections, the hub, and rate limiting.

use std::str::FromStr;
use std::time::Duration;

/// Connection and hub configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Interval between keepalive pings on each connection.
    pub keepalive_interval: Duration,
    /// Read deadline = `keepalive_interval * read_deadline_factor`.
    pub read_deadline_factor: u32,
    /// Deadline for sending a single frame.
    pub write_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Capacity of each of the hub's inbound queues.
    pub hub_queue_capacity: usize,
    /// Largest inbound frame accepted by the transport, in bytes.
    pub max_frame_bytes: usize,
}

/// Defaults used when an env var is absent.
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_READ_DEADLINE_FACTOR: u32 = 2;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_OUTBOUND_QUEUE: usize = 256;
const DEFAULT_HUB_QUEUE: usize = 1024;
const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Shortest keepalive period a connection will run with.
const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

impl RealtimeConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default  |
    /// |-----------------------------|----------|
    /// | `WS_KEEPALIVE_SECS`         | `30`     |
    /// | `WS_READ_DEADLINE_FACTOR`   | `2`      |
    /// | `WS_WRITE_TIMEOUT_SECS`     | `10`     |
    /// | `WS_OUTBOUND_QUEUE`         | `256`    |
    /// | `WS_HUB_QUEUE`              | `1024`   |
    /// | `WS_MAX_FRAME_BYTES`        | `65536`  |
    ///
    /// # Panics
    ///
    /// Panics if a variable is set but does not parse, or if a period or
    /// queue size is zero.
    pub fn from_env() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(positive_env_or(
                "WS_KEEPALIVE_SECS",
                DEFAULT_KEEPALIVE_SECS,
            )),
            read_deadline_factor: positive_env_or(
                "WS_READ_DEADLINE_FACTOR",
                DEFAULT_READ_DEADLINE_FACTOR,
            ),
            write_timeout: Duration::from_secs(positive_env_or(
                "WS_WRITE_TIMEOUT_SECS",
                DEFAULT_WRITE_TIMEOUT_SECS,
            )),
            outbound_queue_capacity: positive_env_or("WS_OUTBOUND_QUEUE", DEFAULT_OUTBOUND_QUEUE),
            hub_queue_capacity: positive_env_or("WS_HUB_QUEUE", DEFAULT_HUB_QUEUE),
            max_frame_bytes: env_or("WS_MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
        }
    }

    /// Keepalive period actually used, never shorter than one second.
    pub fn keepalive(&self) -> Duration {
        self.keepalive_interval.max(MIN_KEEPALIVE)
    }

    /// How long the inbound path waits for a keepalive ack before giving up.
    pub fn read_deadline(&self) -> Duration {
        self.keepalive() * self.read_deadline_factor.max(1)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            read_deadline_factor: DEFAULT_READ_DEADLINE_FACTOR,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE,
            hub_queue_capacity: DEFAULT_HUB_QUEUE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// A fixed-window quota: at most `limit` events per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub window: Duration,
}

impl Quota {
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Rate limiting and lockout policy.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Failed logins per `(ip, username)` before the account is locked.
    pub login: Quota,
    /// How long a lock lasts once the login quota is exhausted.
    pub lock_duration: Duration,
    pub password_reset: Quota,
    pub otp: Quota,
    pub api: Quota,
}

impl RateLimitConfig {
    /// Load rate limit policy from environment variables with defaults.
    ///
    /// | Env Var                        | Default |
    /// |--------------------------------|---------|
    /// | `LOGIN_MAX_ATTEMPTS`           | `5`     |
    /// | `LOGIN_WINDOW_SECS`            | `900`   |
    /// | `ACCOUNT_LOCK_SECS`            | `1800`  |
    /// | `PASSWORD_RESET_MAX_ATTEMPTS`  | `3`     |
    /// | `PASSWORD_RESET_WINDOW_SECS`   | `3600`  |
    /// | `OTP_MAX_ATTEMPTS`             | `5`     |
    /// | `OTP_WINDOW_SECS`              | `600`   |
    /// | `API_RATE_LIMIT`               | `120`   |
    /// | `API_RATE_WINDOW_SECS`         | `60`    |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            login: quota_from_env("LOGIN_MAX_ATTEMPTS", "LOGIN_WINDOW_SECS", defaults.login),
            lock_duration: Duration::from_secs(env_or(
                "ACCOUNT_LOCK_SECS",
                defaults.lock_duration.as_secs(),
            )),
            password_reset: quota_from_env(
                "PASSWORD_RESET_MAX_ATTEMPTS",
                "PASSWORD_RESET_WINDOW_SECS",
                defaults.password_reset,
            ),
            otp: quota_from_env("OTP_MAX_ATTEMPTS", "OTP_WINDOW_SECS", defaults.otp),
            api: quota_from_env("API_RATE_LIMIT", "API_RATE_WINDOW_SECS", defaults.api),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: Quota::new(5, Duration::from_secs(15 * 60)),
            lock_duration: Duration::from_secs(30 * 60),
            password_reset: Quota::new(3, Duration::from_secs(60 * 60)),
            otp: Quota::new(5, Duration::from_secs(10 * 60)),
            api: Quota::new(120, Duration::from_secs(60)),
        }
    }
}

fn quota_from_env(limit_var: &str, window_var: &str, default: Quota) -> Quota {
    Quota {
        limit: env_or(limit_var, default.limit),
        window: Duration::from_secs(env_or(window_var, default.window.as_secs())),
    }
}

fn positive_env_or<T>(var: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
{
    let value = env_or(var, default);
    assert!(value > T::default(), "{var} must be positive");
    value
}

fn env_or<T>(var: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{var} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
