use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the database is reachable.
    pub db_healthy: bool,
    /// Whether the realtime hub task is running.
    pub realtime_healthy: bool,
    /// Open WebSocket connections.
    pub connections: usize,
}

/// GET /health -- returns service, database and hub health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = ussdhub_db::health_check(&state.pool).await.is_ok();
    let connections = state.realtime.hub.connection_count().await;
    let realtime_healthy = connections.is_ok();

    let status = if db_healthy && realtime_healthy {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        realtime_healthy,
        connections: connections.unwrap_or(0),
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
