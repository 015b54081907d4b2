//! Row structs and DTOs.
//!
//! Each submodule contains a `FromRow` entity matching the database row and,
//! where rows are inserted from Rust, a create DTO.

pub mod notification;
pub mod session;
pub mod user;
