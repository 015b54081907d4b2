//! Tests for the dual-tier session store, the blacklist and the
//! authentication chain built on them.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;

use ussdhub_realtime::session::SessionRecord;
use ussdhub_realtime::store::{KeyTtl, VolatileStore};
use ussdhub_realtime::AuthError;

use common::harness;

fn record(identity_id: i64, token: &str) -> SessionRecord {
    SessionRecord::new(identity_id, token, Utc::now() + chrono::Duration::hours(1))
        .with_roles(vec!["agent".into()], vec!["offers:read".into()])
}

/// Let detached side-effect tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ---------------------------------------------------------------------------
// Test: create then get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_session_is_readable_and_not_blacklisted() {
    let h = harness();
    let sessions = &h.realtime.sessions;

    sessions
        .create(&record(42, "abc"), Duration::from_secs(3600))
        .await
        .unwrap();

    let found = sessions.get(42, "abc").await.unwrap();
    assert!(found.is_active);
    assert_eq!(found.identity_id, 42);
    assert_eq!(found.session_token, "abc");
    assert_eq!(found.roles, ["agent"]);
    assert!(!sessions.is_blacklisted("abc").await.unwrap());
}

#[tokio::test]
async fn create_rejects_zero_ttl() {
    let h = harness();
    let err = h
        .realtime
        .sessions
        .create(&record(42, "abc"), Duration::ZERO)
        .await
        .unwrap_err();
    assert_matches!(err, AuthError::ExpiredInput);
}

#[tokio::test]
async fn create_bumps_durable_activity_in_the_background() {
    let h = harness();
    let durable_id = h.directory.add_session(42, "abc");
    let mut rec = record(42, "abc");
    rec.durable_id = Some(durable_id);

    h.realtime
        .sessions
        .create(&rec, Duration::from_secs(60))
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        h.directory
            .activity_updates
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn create_succeeds_even_if_durable_activity_update_fails() {
    let h = harness();
    let durable_id = h.directory.add_session(42, "abc");
    h.directory.set_failing(true);
    let mut rec = record(42, "abc");
    rec.durable_id = Some(durable_id);

    h.realtime
        .sessions
        .create(&rec, Duration::from_secs(60))
        .await
        .unwrap();
    settle().await;
    h.directory.set_failing(false);
    assert!(h.realtime.sessions.get(42, "abc").await.is_ok());
}

// ---------------------------------------------------------------------------
// Test: touch keeps the remaining TTL
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn get_touches_without_extending_ttl() {
    let h = harness();
    h.realtime
        .sessions
        .create(&record(42, "abc"), Duration::from_secs(100))
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    let before = h.realtime.sessions.get(42, "abc").await.unwrap();
    assert_eq!(
        h.cache.ttl("session:42:abc").await.unwrap(),
        KeyTtl::Expires(Duration::from_secs(60))
    );

    let after = h.realtime.sessions.get(42, "abc").await.unwrap();
    assert!(after.last_activity_at >= before.last_activity_at);
}

#[tokio::test]
async fn touch_on_missing_session_is_not_an_error() {
    let h = harness();
    h.realtime.sessions.touch(42, "gone").await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: blacklist
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn blacklisted_token_is_rejected_until_ttl_elapses() {
    let h = harness();
    let bearer = h.login(42, "abc", &["agent"], &[]).await;

    h.realtime
        .sessions
        .blacklist("abc", Duration::from_secs(60))
        .await
        .unwrap();

    let err = h.realtime.authenticator.authenticate(&bearer).await.unwrap_err();
    assert_matches!(err, AuthError::TokenRevoked);

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_matches!(
        h.realtime.authenticator.authenticate(&bearer).await,
        Err(AuthError::TokenRevoked)
    );

    tokio::time::advance(Duration::from_secs(1)).await;
    let auth = h.realtime.authenticator.authenticate(&bearer).await.unwrap();
    assert_eq!(auth.identity_id(), 42);
}

#[tokio::test]
async fn blacklist_with_zero_ttl_writes_nothing() {
    let h = harness();
    h.realtime
        .sessions
        .blacklist("abc", Duration::ZERO)
        .await
        .unwrap();
    assert!(!h.realtime.sessions.is_blacklisted("abc").await.unwrap());
}

#[tokio::test]
async fn blacklist_check_fails_closed_when_cache_is_down() {
    let h = harness();
    let bearer = h.login(42, "abc", &[], &[]).await;
    h.cache.set_down(true);

    let err = h.realtime.authenticator.authenticate(&bearer).await.unwrap_err();
    assert_matches!(err, AuthError::Store(_));
}

#[tokio::test]
async fn unknown_bearer_is_invalid_token() {
    let h = harness();
    let err = h
        .realtime
        .authenticator
        .authenticate("forged")
        .await
        .unwrap_err();
    assert_matches!(err, AuthError::InvalidToken);
}

#[tokio::test]
async fn revoke_blacklists_and_invalidates() {
    let h = harness();
    h.directory.add_session(42, "abc");
    let bearer = h.login(42, "abc", &[], &[]).await;

    h.realtime
        .sessions
        .revoke(42, "abc", Duration::from_secs(300))
        .await
        .unwrap();

    assert!(h.realtime.sessions.is_blacklisted("abc").await.unwrap());
    assert!(!h.directory.is_active("abc"));
    assert_matches!(
        h.realtime.authenticator.authenticate(&bearer).await,
        Err(AuthError::TokenRevoked)
    );
}

// ---------------------------------------------------------------------------
// Test: invalidation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalidate_all_removes_every_session_of_identity() {
    let h = harness();
    h.directory.add_identity(42, &["agent"], &[]);
    for token in ["a", "b", "c"] {
        h.directory.add_session(42, token);
        h.realtime
            .sessions
            .create(&record(42, token), Duration::from_secs(3600))
            .await
            .unwrap();
    }
    h.realtime
        .sessions
        .create(&record(43, "other"), Duration::from_secs(3600))
        .await
        .unwrap();

    let removed = h.realtime.sessions.invalidate_all(42).await.unwrap();
    assert_eq!(removed, 3);

    for token in ["a", "b", "c"] {
        assert_matches!(
            h.realtime.sessions.get(42, token).await,
            Err(AuthError::SessionNotFound)
        );
    }
    assert!(h.realtime.sessions.list_active(42).await.unwrap().is_empty());
    assert_eq!(h.realtime.sessions.list_active(43).await.unwrap().len(), 1);
}

#[tokio::test]
async fn revoke_all_wins_against_an_in_flight_cache_warm_up() {
    let h = harness();
    h.directory.add_identity(42, &["agent"], &[]);
    h.directory.add_session(42, "abc");
    let bearer = h.verifier.issue(42, "abc", &["agent"], &[]);

    // Cold cache: this lookup schedules a warm-up that has not run yet.
    h.realtime.authenticator.authenticate(&bearer).await.unwrap();
    h.realtime.revoke_all(42, "logout_all").await.unwrap();
    settle().await;

    assert!(h.realtime.sessions.is_blacklisted("abc").await.unwrap());
    assert_matches!(
        h.realtime.authenticator.authenticate(&bearer).await,
        Err(AuthError::TokenRevoked)
    );
}

#[tokio::test]
async fn invalidate_all_blacklists_cache_only_sessions() {
    let h = harness();
    let bearer = h.login(42, "cached", &[], &[]).await;

    h.realtime.sessions.invalidate_all(42).await.unwrap();

    assert!(h.realtime.sessions.is_blacklisted("cached").await.unwrap());
    assert_matches!(
        h.realtime.authenticator.authenticate(&bearer).await,
        Err(AuthError::TokenRevoked)
    );
}

#[tokio::test]
async fn invalidate_survives_cache_outage_but_marks_row_inactive() {
    let h = harness();
    h.directory.add_session(42, "abc");
    h.cache.set_down(true);

    h.realtime.sessions.invalidate(42, "abc").await.unwrap();
    assert!(!h.directory.is_active("abc"));
}

#[tokio::test]
async fn invalidate_surfaces_directory_failure() {
    let h = harness();
    h.directory.set_failing(true);
    let err = h.realtime.sessions.invalidate(42, "abc").await.unwrap_err();
    assert_matches!(err, AuthError::Store(_));
}

// ---------------------------------------------------------------------------
// Test: directory fallback and cache warm-up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_miss_falls_back_to_directory_and_warms_cache() {
    let h = harness();
    h.directory.add_identity(42, &["admin"], &["transactions:read"]);
    let durable_id = h.directory.add_session(42, "abc");

    let found = h.realtime.sessions.get(42, "abc").await.unwrap();
    assert_eq!(found.durable_id, Some(durable_id));
    assert_eq!(found.roles, ["admin"]);
    assert_eq!(found.permissions, ["transactions:read"]);
    assert_eq!(found.device.as_deref(), Some("web"));

    settle().await;
    assert!(h.cache.exists("session:42:abc").await.unwrap());
    assert_matches!(
        h.cache.ttl("session:42:abc").await.unwrap(),
        KeyTtl::Expires(_)
    );
}

#[tokio::test]
async fn cache_outage_is_recovered_from_directory() {
    let h = harness();
    h.directory.add_identity(42, &["agent"], &[]);
    h.directory.add_session(42, "abc");
    h.cache.set_down(true);

    let found = h.realtime.sessions.get(42, "abc").await.unwrap();
    assert!(found.is_active);
}

#[tokio::test]
async fn directory_failure_on_fallback_is_session_not_found() {
    let h = harness();
    h.directory.set_failing(true);
    let err = h.realtime.sessions.get(42, "abc").await.unwrap_err();
    assert_matches!(err, AuthError::SessionNotFound);
}

#[tokio::test]
async fn directory_row_of_another_identity_is_a_mismatch() {
    let h = harness();
    h.directory.add_identity(43, &[], &[]);
    h.directory.add_session(43, "abc");
    let err = h.realtime.sessions.get(42, "abc").await.unwrap_err();
    assert_matches!(err, AuthError::IdentityMismatch);
}

#[tokio::test]
async fn inactive_directory_row_is_not_restored() {
    let h = harness();
    h.directory.add_identity(42, &[], &[]);
    h.directory.add_session(42, "abc");
    h.realtime.sessions.invalidate(42, "abc").await.unwrap();

    assert_matches!(
        h.realtime.sessions.get(42, "abc").await,
        Err(AuthError::SessionNotFound)
    );
}

// ---------------------------------------------------------------------------
// Test: list_active
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_active_reads_only_the_cache() {
    let h = harness();
    h.directory.add_identity(42, &[], &[]);
    h.directory.add_session(42, "durable-only");
    h.realtime
        .sessions
        .create(&record(42, "cached"), Duration::from_secs(3600))
        .await
        .unwrap();

    let active = h.realtime.sessions.list_active(42).await.unwrap();
    let tokens: Vec<_> = active.iter().map(|s| s.session_token.as_str()).collect();
    assert_eq!(tokens, ["cached"]);

    h.cache.set_down(true);
    assert_matches!(
        h.realtime.sessions.list_active(42).await,
        Err(AuthError::Store(_))
    );
}
