//! Well-known broadcast channel names.
//!
//! A connection only receives a broadcast when it has subscribed to the
//! broadcast's channel. Which connections may subscribe to which channel is
//! decided by `ussdhub_realtime::channel::can_subscribe`.

/// In-app notifications (bell counter, toasts).
pub const CHANNEL_NOTIFICATIONS: &str = "notifications";

/// Offer catalogue changes (price, availability).
pub const CHANNEL_OFFERS: &str = "offers";

/// Customer subscription lifecycle events.
pub const CHANNEL_SUBSCRIPTIONS: &str = "subscriptions";

/// Promotional campaign progress.
pub const CHANNEL_CAMPAIGNS: &str = "campaigns";

/// USSD transaction results. Requires [`PERMISSION_TRANSACTIONS_READ`].
pub const CHANNEL_TRANSACTIONS: &str = "transactions";

/// Platform-wide alerts and session notices.
pub const CHANNEL_SYSTEM: &str = "system";

/// Administrative activity feed. Elevated roles only.
pub const CHANNEL_ADMIN: &str = "admin";

/// Audit trail feed. Elevated roles only.
pub const CHANNEL_AUDIT: &str = "audit";

/// Prefix of the per-identity private channel, e.g. `user:42`.
pub const USER_CHANNEL_PREFIX: &str = "user:";

/// Permission that unlocks [`CHANNEL_TRANSACTIONS`].
pub const PERMISSION_TRANSACTIONS_READ: &str = "transactions:read";

/// Build the private channel name for an identity.
pub fn user_channel(identity_id: crate::types::DbId) -> String {
    format!("{USER_CHANNEL_PREFIX}{identity_id}")
}
