//! Health check and general HTTP behaviour.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use tower::ServiceExt;

use common::{body_json, build_test_app, get, test_config, unreachable_pool};

#[tokio::test]
async fn health_reports_degraded_without_database() {
    let (app, _state) = build_test_app(unreachable_pool(), test_config());
    let response = get(app, "/health", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["db_healthy"], false);
    assert_eq!(json["realtime_healthy"], true);
    assert_eq!(json["connections"], 0);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn health_reports_stopped_hub() {
    let (app, state) = build_test_app(unreachable_pool(), test_config());
    state.realtime.hub.shutdown().await.unwrap();

    let json = body_json(get(app, "/health", None).await).await;
    assert_eq!(json["realtime_healthy"], false);
    assert_eq!(json["status"], "degraded");
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (app, _state) = build_test_app(unreachable_pool(), test_config());
    let response = get(app, "/this-route-does-not-exist", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let (app, _state) = build_test_app(unreachable_pool(), test_config());
    let response = get(app, "/health", None).await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("Response must contain an x-request-id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn cors_preflight_is_answered_before_auth() {
    let (app, _state) = build_test_app(unreachable_pool(), test_config());
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/v1/sessions")
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "DELETE")
        .header("access-control-request-headers", "authorization")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers["access-control-allow-origin"],
        "http://localhost:5173"
    );
    let methods = headers["access-control-allow-methods"].to_str().unwrap();
    assert!(methods.contains("DELETE"));
    assert!(!methods.contains("PUT"));
}
