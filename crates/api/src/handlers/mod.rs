//! Request handlers.
//!
//! Handlers delegate persistence to the repositories in `ussdhub_db`, session
//! and connection work to the realtime context, and map errors via
//! [`AppError`](crate::error::AppError).

pub mod admin;
pub mod auth;
pub mod sessions;
