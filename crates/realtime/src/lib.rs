//! Session-aware realtime broadcast core.
//!
//! - [`store`] -- volatile key/value store with TTLs (cache tier).
//! - [`session`] -- dual-tier session store and token blacklist.
//! - [`rate_limit`] -- fixed-window counters and account locks.
//! - [`auth`] -- bearer credential → verified, non-revoked session.
//! - [`hub`] -- single-writer connection registry and broadcast loop.
//! - [`client`] -- per-connection inbound/outbound tasks.
//! - [`handlers`] -- message-type dispatch table for feature modules.
//!
//! Everything is wired together through an explicit [`Realtime`] context
//! built once at startup.

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod rate_limit;
pub mod session;
pub mod store;

pub use context::Realtime;
pub use error::AuthError;
