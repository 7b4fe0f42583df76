//! Tests for health check endpoints.

use axum::http::StatusCode;
use integration_tests::setup::TestContext;
use telemetry::health;

/// Test /health endpoint returns proper structure
#[tokio::test]
async fn test_health_endpoint_structure() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body: serde_json::Value = response.json();
    for field in [
        "status",
        "broker_connected",
        "store_connected",
        "scheduler_alive",
        "buffered_records",
        "components",
    ] {
        assert!(body.get(field).is_some(), "Response should have '{}' field", field);
    }

    let status = body["status"].as_str().unwrap_or("");
    assert!(
        status == "healthy" || status == "degraded" || status == "unhealthy",
        "unexpected status '{}'",
        status
    );
    assert_eq!(body["components"].as_array().unwrap().len(), 3);
}

/// Readiness follows broker reachability
#[tokio::test]
async fn test_ready_follows_broker() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    health().broker.set_unhealthy("probe failed");
    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);

    broker::health::check_connection(ctx.broker.as_ref()).await;
    server.get("/health/ready").await.assert_status_ok();
}

/// Test /health/live endpoint always returns 200 when service is running
#[tokio::test]
async fn test_live_endpoint() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    server.get("/health/live").await.assert_status_ok();
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    server
        .get("/nonexistent")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
