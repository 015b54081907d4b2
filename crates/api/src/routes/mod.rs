pub mod admin;
pub mod auth;
pub mod health;

use axum::routing::get;
use axum::Router;

use crate::handlers::sessions;
use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                                  WebSocket (bearer header or ?token=)
///
/// /auth/login                          login (public)
/// /auth/logout                         revoke current session
/// /auth/logout-all                     revoke every session
///
/// /sessions                            caller's active sessions
///
/// /admin/users/{id}/disconnect         close a user's connections
/// /admin/users/{id}/notify             store + push a notification
/// /admin/broadcast                     system alert to a channel
/// /admin/realtime/stats                hub counters and online users
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/auth", auth::router())
        .route("/sessions", get(sessions::list_active))
        .nest("/admin", admin::router())
}
