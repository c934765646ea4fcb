mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use manifold::detail_log::DetailedRequestLogger;
use manifold::types::*;
use manifold::{AppState, Args};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower::util::ServiceExt;

fn test_args() -> Args {
    Args {
        port: 8080,
        host: "127.0.0.1".to_string(),
        config: "test-config.json".to_string(),
        credentials: "test-credentials.json".to_string(),
        logs_dir: "logs".to_string(),
        detailed_request_log: false,
        detailed_request_log_max_size_mb: 20,
        request_log: false,
        request_timeout_secs: 120,
        connect_timeout_secs: 10,
        max_body_size: 1024 * 1024,
    }
}

fn setup_router(h: &Harness) -> axum::Router {
    let logs_dir = std::env::temp_dir().join(format!(
        "manifold-mgmt-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let state = Arc::new(AppState {
        config: h.config.clone(),
        states: h.states.clone(),
        health: h.health.clone(),
        engine: h.engine.clone(),
        activity: h.activity.clone(),
        auths: Arc::new(manifold::dispatch::AuthRegistry::from_auths(Vec::new())),
        detail_log: DetailedRequestLogger::new(false, logs_dir, 20),
        show_retries: Arc::new(AtomicBool::new(false)),
        args: Arc::new(test_args()),
    });

    axum::Router::new()
        .nest("/v0/management", manifold::management::router())
        .with_state(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_route_crud_over_http() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    let app = setup_router(&h);

    // Create.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v0/management/routes")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"name": "new-route", "aliases": ["fresh"]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("route-"));

    // List includes both routes.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v0/management/routes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed["routes"].as_array().unwrap().len(), 2);

    // Delete, then 404 on fetch.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v0/management/routes/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v0/management/routes/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_conflicting_route_name_returns_409() {
    let h = build_harness("gpt-pro", &["Pro"], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    let app = setup_router(&h);

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v0/management/routes")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name": "PRO"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_invalid_route_name_returns_400_with_fields() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    let app = setup_router(&h);

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v0/management/routes")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name": "bad name!"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["field"], "name");
}

#[tokio::test]
async fn test_state_overview_reflects_cooling_target() {
    let h = build_harness(
        "gpt-pro",
        &[],
        vec![
            (1, Strategy::FirstAvailable, vec!["t1", "t2"]),
            (2, Strategy::FirstAvailable, vec!["t3"]),
        ],
    );
    h.states.start_cooldown_untimed("t1");
    let app = setup_router(&h);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v0/management/state/overview")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let overview = body_json(response).await;

    assert_eq!(overview["total_routes"], 1);
    assert_eq!(overview["degraded_routes"], 1);
    let route = &overview["routes"][0];
    assert_eq!(route["status"], "degraded");
    // Layer 1 still has a healthy target, so it stays active.
    assert_eq!(route["active_layer"], 1);
    assert_eq!(route["layer_states"][0]["status"], "active");
    assert_eq!(route["layer_states"][1]["status"], "standby");
}

#[tokio::test]
async fn test_force_cooldown_and_reset_endpoints() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    let app = setup_router(&h);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v0/management/targets/t1/force-cooldown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let state = h.states.get_target_state("t1").unwrap();
    assert_eq!(state.status, TargetStatus::Cooling);
    assert!(state.cooldown_ends_at.is_none());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v0/management/targets/t1/reset")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        h.states.get_target_state("t1").unwrap().status,
        TargetStatus::Healthy
    );
}

#[tokio::test]
async fn test_settings_roundtrip_over_http() {
    let h = build_harness("gpt-pro", &[], vec![(1, Strategy::FirstAvailable, vec!["t1"])]);
    let app = setup_router(&h);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v0/management/settings")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"enabled": false, "hide_original_models": true}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v0/management/settings")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let settings = body_json(response).await;
    assert_eq!(settings["enabled"], false);
    assert_eq!(settings["hide_original_models"], true);
}
