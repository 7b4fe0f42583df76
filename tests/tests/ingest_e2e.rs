//! Ingestion endpoint tests: HTTP in, mock columnar store out.

use axum::http::StatusCode;
use engine_core::TaskStatus;
use integration_tests::fixtures::{task_request, tick_line, tick_lines, tick_records};
use integration_tests::setup::{TestContext, TestOptions};
use std::time::Duration;

#[tokio::test]
async fn test_line_protocol_accepted_and_flushed() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server.post("/ingest").text(tick_lines(40)).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["received"], 40);
    assert_eq!(body["occupancy"], 40);

    assert_eq!(ctx.pipeline.flush().await, 40);

    let records = ctx.store.captured_records();
    assert_eq!(records.len(), 40);
    assert_eq!(records[0].measurement, "ticks");
    assert_eq!(records[0].tags["symbol"], "AAPL");
    // Submission order is preserved through the batch.
    let seqs: Vec<f64> = records
        .iter()
        .filter_map(|r| r.fields["seq"].as_f64())
        .collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_json_records_accepted() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server.post("/ingest").json(&tick_records(5)).await;
    response.assert_status(StatusCode::ACCEPTED);

    ctx.pipeline.flush().await;
    assert_eq!(ctx.store.record_count(), 5);
    assert_eq!(ctx.store.captured_records()[0].tags["symbol"], "MSFT");
}

#[tokio::test]
async fn test_flush_task_writes_on_age() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    let _flush = ctx.start_flush_task();

    server
        .post("/ingest")
        .text(tick_line("AAPL", 187.5, 1))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let store = ctx.store.clone();
    assert!(ctx.eventually(Duration::from_secs(2), || store.record_count() == 1).await);
}

#[tokio::test]
async fn test_malformed_line_rejected_whole() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let body = format!("{}\nticks,symbol=AAPL\n", tick_line("AAPL", 1.0, 1));
    let response = server.post("/ingest").text(body).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json();
    assert_eq!(error["code"], "VALID_001");

    assert_eq!(ctx.pipeline.stats().occupancy, 0);
}

#[tokio::test]
async fn test_empty_body_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    server
        .post("/ingest")
        .text("\n# nothing here\n")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

/// A request that would cross the high-water mark is refused in full.
#[tokio::test]
async fn test_backpressure_returns_429() {
    let ctx = TestContext::build(
        TestOptions {
            high_water: 10,
            ..TestOptions::default()
        },
        |_| {},
    )
    .await;
    let server = ctx.server();

    server
        .post("/ingest")
        .text(tick_lines(8))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = server.post("/ingest").text(tick_lines(5)).await;
    response.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.header("Retry-After"), "1");
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "INGEST_001");

    assert_eq!(ctx.pipeline.stats().occupancy, 8);

    // Draining the buffer makes room again.
    ctx.pipeline.flush().await;
    server
        .post("/ingest")
        .text(tick_lines(5))
        .await
        .assert_status(StatusCode::ACCEPTED);
}

/// Batches spilled during a store outage are replayed by the built-in task.
#[tokio::test]
async fn test_store_outage_spills_then_replays() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    ctx.store.set_should_fail(true);
    server
        .post("/ingest")
        .text(tick_lines(12))
        .await
        .assert_status(StatusCode::ACCEPTED);
    ctx.pipeline.flush().await;
    assert_eq!(ctx.store.record_count(), 0);
    assert_eq!(ctx.pipeline.spilled_batches().await.unwrap(), 1);

    ctx.store.set_should_fail(false);
    let body: serde_json::Value = server
        .post("/tasks")
        .json(&task_request("replay_spill", serde_json::json!({})))
        .await
        .json();
    let id = body["task_id"].as_str().unwrap().parse().unwrap();

    let result = ctx.wait_for_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.result.unwrap()["records"], 12);
    assert_eq!(ctx.store.record_count(), 12);
    assert_eq!(ctx.pipeline.spilled_batches().await.unwrap(), 0);
}
