//! Integration tests for the collector API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use collector_lib::{
    health::components,
    report::{NodeReport, ReportEntry},
    store::ChainEntry,
    ChangeKind, ClusterState, CollectorMetrics, CorrelationId, Entity, HealthRegistry,
    IdAllocator, NewDataSignal, ObjectKey, ReportBuffer,
};
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::RELAY).await;
    health_registry.register(&components::watch("Pod")).await;

    let cluster = Arc::new(ClusterState::new(Arc::new(IdAllocator::new())));
    let buffer = Arc::new(ReportBuffer::new(NewDataSignal::new()));
    let state = Arc::new(AppState::new(health_registry, cluster, buffer));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::RELAY, "Report endpoint unreachable")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(&components::watch("Pod"), "Watch rejected")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let (app, _state) = setup_test_app().await;

    let (_, health) = get_json(app, "/healthz").await;

    assert!(health["components"]["relay"].is_object());
    assert!(health["components"]["watch:pod"].is_object());
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;
    state
        .health_registry
        .set_unhealthy(components::RELAY, "Failed")
        .await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Unhealthy: relay");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app().await;

    let metrics = CollectorMetrics::new();
    metrics.inc_watch_event("Pod", "added");
    metrics.observe_report_sent(512);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("cluster_collector_watch_events_total"));
    assert!(metrics_text.contains("cluster_collector_reports_sent_total"));
    assert!(metrics_text.contains("cluster_collector_report_bytes_bucket"));
}

#[tokio::test]
async fn test_state_reports_store_counts_and_pending_entries() {
    let (app, state) = setup_test_app().await;

    let id = state.cluster.allocator.allocate();
    state.cluster.nodes.init(id).await;
    state
        .cluster
        .nodes
        .push_back(
            id,
            ChainEntry::Entity(Entity {
                id,
                key: ObjectKey::new(None, "node-1"),
                object: Node::default(),
            }),
        )
        .await
        .unwrap();
    state
        .buffer
        .add(
            ReportEntry::Node(NodeReport {
                id: CorrelationId::from(1),
                name: "node-1".to_string(),
                node: Node::default(),
            }),
            ChangeKind::Created,
        )
        .await;

    let (status, body) = get_json(app, "/state").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"], 1);
    assert_eq!(body["microservices"], 0);
    assert_eq!(body["ids_outstanding"], 1);
    assert_eq!(body["pending_report_entries"], 1);
}
