//! Monitor endpoint tests.

use engine_core::{Error, TaskStatus};
use integration_tests::fixtures::tick_lines;
use integration_tests::setup::TestContext;
use std::time::Duration;
use worker::EnqueueOptions;

#[tokio::test]
async fn test_monitor_reports_queue_depths() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    for queue in ["critical", "default", "default", "low"] {
        ctx.producer
            .enqueue(
                "persist_metrics",
                serde_json::json!({}),
                EnqueueOptions::default().queue(queue),
            )
            .await
            .unwrap();
    }
    server.post("/ingest").text(tick_lines(3)).await;

    let response = server.get("/monitor").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();

    assert_eq!(body["broker_reachable"], true);
    let queues = body["queues"].as_array().unwrap();
    let depth = |name: &str| {
        queues
            .iter()
            .find(|q| q["queue"] == name)
            .map(|q| q["ready"].as_u64().unwrap())
    };
    assert_eq!(depth("critical"), Some(1));
    assert_eq!(depth("default"), Some(2));
    assert_eq!(depth("low"), Some(1));

    assert_eq!(body["recent_results"].as_array().unwrap().len(), 4);
    assert_eq!(body["recent_results"][0]["status"], "pending");
    assert_eq!(body["ingestion"]["occupancy"], 3);
    assert_eq!(body["workers"]["running"], true);
    assert!(body["scheduler"]["instance_id"].is_string());
    assert!(body["metrics"]["tasks_enqueued"].as_u64().unwrap() >= 4);
}

#[tokio::test]
async fn test_monitor_lists_dead_letters() {
    let ctx = TestContext::with_handlers(|registry| {
        registry
            .register_fn("doomed", |_ctx, _args| async {
                Err::<serde_json::Value, _>(Error::handler("nope"))
            })
            .unwrap();
    })
    .await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    let id = ctx
        .producer
        .enqueue("doomed", serde_json::json!({}), EnqueueOptions::default().retries(0))
        .await
        .unwrap();
    let result = ctx.wait_for_terminal(id, Duration::from_secs(5)).await;
    assert_eq!(result.status, TaskStatus::Failure);

    let body: serde_json::Value = server.get("/monitor").await.json();
    assert_eq!(body["dead_letter_count"], 1);
    assert_eq!(body["dead_letters"][0]["message"]["id"], id.to_string());
}

#[tokio::test]
async fn test_monitor_limit_caps_recent_results() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    for _ in 0..6 {
        ctx.producer
            .enqueue("persist_metrics", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let body: serde_json::Value = server
        .get("/monitor")
        .add_query_param("limit", 2)
        .await
        .json();
    assert_eq!(body["recent_results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_monitor_survives_broker_outage() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    ctx.broker.set_available(false);
    let response = server.get("/monitor").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["broker_reachable"], false);
    assert!(body["queues"].as_array().unwrap().is_empty());
}
