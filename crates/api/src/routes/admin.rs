//! Route definitions for `/admin` realtime operations.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::admin;
use crate::state::AppState;

/// Routes mounted at `/admin`.
///
/// ```text
/// POST /users/{id}/disconnect  -> disconnect_user
/// POST /users/{id}/notify      -> notify_user
/// POST /broadcast              -> broadcast
/// GET  /realtime/stats         -> realtime_stats
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/{id}/disconnect", post(admin::disconnect_user))
        .route("/users/{id}/notify", post(admin::notify_user))
        .route("/broadcast", post(admin::broadcast))
        .route("/realtime/stats", get(admin::realtime_stats))
}
