//! Shared domain vocabulary for the USSD hub realtime core.
//!
//! Holds the primitive id/timestamp aliases, the domain error type, role and
//! channel name constants, and the [`directory::SessionDirectory`] seam that
//! the relational layer implements.

pub mod channels;
pub mod directory;
pub mod error;
pub mod roles;
pub mod types;
