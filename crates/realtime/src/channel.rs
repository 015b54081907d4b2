//! Who may subscribe to which broadcast channel.

use ussdhub_core::channels::{
    CHANNEL_ADMIN, CHANNEL_AUDIT, CHANNEL_CAMPAIGNS, CHANNEL_NOTIFICATIONS, CHANNEL_OFFERS,
    CHANNEL_SUBSCRIPTIONS, CHANNEL_SYSTEM, CHANNEL_TRANSACTIONS, PERMISSION_TRANSACTIONS_READ,
    USER_CHANNEL_PREFIX,
};
use ussdhub_core::roles::has_elevated_role;
use ussdhub_core::types::DbId;

/// The identity snapshot a subscription decision is made against.
#[derive(Debug, Clone, Copy)]
pub struct Subscriber<'a> {
    pub identity_id: DbId,
    pub roles: &'a [String],
    pub permissions: &'a [String],
}

/// What a channel requires of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    Authenticated,
    Elevated,
    Permission(&'static str),
    Owner(DbId),
    Denied,
}

fn requirement(channel: &str) -> Requirement {
    match channel {
        CHANNEL_NOTIFICATIONS | CHANNEL_OFFERS | CHANNEL_SUBSCRIPTIONS | CHANNEL_CAMPAIGNS
        | CHANNEL_SYSTEM => Requirement::Authenticated,
        CHANNEL_TRANSACTIONS => Requirement::Permission(PERMISSION_TRANSACTIONS_READ),
        CHANNEL_ADMIN | CHANNEL_AUDIT => Requirement::Elevated,
        other => match other
            .strip_prefix(USER_CHANNEL_PREFIX)
            .and_then(|id| id.parse::<DbId>().ok())
        {
            Some(owner) => Requirement::Owner(owner),
            None => Requirement::Denied,
        },
    }
}

/// Whether `subscriber` may subscribe to `channel`.
///
/// Elevated roles pass every requirement except another identity's private
/// channel. Unknown channels are denied.
pub fn can_subscribe(subscriber: &Subscriber<'_>, channel: &str) -> bool {
    let elevated = has_elevated_role(subscriber.roles);
    match requirement(channel) {
        Requirement::Authenticated => true,
        Requirement::Elevated => elevated,
        Requirement::Permission(p) => elevated || subscriber.permissions.iter().any(|x| x == p),
        Requirement::Owner(owner) => owner == subscriber.identity_id,
        Requirement::Denied => false,
    }
}
