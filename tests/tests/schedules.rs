//! Schedule register and leader-election tests.

use axum::http::StatusCode;
use broker::Broker;
use chrono::{Duration as ChronoDuration, Utc};
use engine_core::Cadence;
use integration_tests::fixtures::{cron_schedule, interval_schedule};
use integration_tests::setup::TestContext;
use std::time::Duration;
use worker::NewSchedule;

fn every_minute(name: &str, task_type: &str) -> NewSchedule {
    NewSchedule {
        name: name.to_string(),
        task_type: task_type.to_string(),
        cadence: Cadence::every(60),
        payload_template: serde_json::json!({}),
        queue: None,
        enabled: true,
        catch_up: false,
        retries: None,
        priority: None,
    }
}

#[tokio::test]
async fn test_create_get_and_list() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server
        .post("/schedules")
        .json(&interval_schedule("metrics", "persist_metrics", 30))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: serde_json::Value = response.json();
    assert_eq!(created["name"], "metrics");
    assert_eq!(created["enabled"], true);
    assert_eq!(created["payload_template"]["source"], "metrics");

    let response = server
        .post("/schedules")
        .json(&cron_schedule("replay", "replay_spill", "0 */5 * * * *"))
        .await;
    response.assert_status(StatusCode::CREATED);

    let list: Vec<serde_json::Value> = server.get("/schedules").await.json();
    let names: Vec<&str> = list.iter().filter_map(|e| e["name"].as_str()).collect();
    assert_eq!(names, vec!["metrics", "replay"]);

    let response = server.get("/schedules/metrics").await;
    response.assert_status_ok();

    let response = server.get("/schedules/nope").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "SCHED_002");
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    let body = interval_schedule("metrics", "persist_metrics", 30);

    server.post("/schedules").json(&body).await.assert_status(StatusCode::CREATED);
    server
        .post("/schedules")
        .json(&body)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_cadence_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server
        .post("/schedules")
        .json(&cron_schedule("broken", "persist_metrics", "every tuesday"))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "SCHED_003");

    let response = server
        .post("/schedules")
        .json(&interval_schedule("zero", "persist_metrics", 0))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = server
        .post("/schedules")
        .json(&interval_schedule("forever", "persist_metrics", u64::MAX))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "SCHED_003");
}

#[tokio::test]
async fn test_unregistered_task_type_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server
        .post("/schedules")
        .json(&interval_schedule("mystery", "does_not_exist", 30))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "TASK_003");
}

#[tokio::test]
async fn test_update_disable_enable() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    server
        .post("/schedules")
        .json(&interval_schedule("metrics", "persist_metrics", 30))
        .await
        .assert_status(StatusCode::CREATED);

    let response = server
        .put("/schedules/metrics")
        .json(&serde_json::json!({ "cadence": { "kind": "interval", "seconds": 120 } }))
        .await;
    response.assert_status_ok();
    let updated: serde_json::Value = response.json();
    assert_eq!(updated["cadence"]["seconds"], 120);

    let disabled: serde_json::Value = server.post("/schedules/metrics/disable").await.json();
    assert_eq!(disabled["enabled"], false);

    let before = Utc::now();
    let enabled: serde_json::Value = server.post("/schedules/metrics/enable").await.json();
    assert_eq!(enabled["enabled"], true);
    let next: chrono::DateTime<Utc> =
        serde_json::from_value(enabled["next_run_at"].clone()).unwrap();
    assert!(next > before);

    server
        .post("/schedules/nope/disable")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

/// Two instances ticking at the same instant enqueue the occurrence once.
#[tokio::test]
async fn test_racing_schedulers_fire_once() {
    let ctx = TestContext::new().await;
    let entry = ctx
        .scheduler
        .create(every_minute("metrics", "persist_metrics"))
        .await
        .unwrap();

    let a = ctx.scheduler.clone();
    let b = ctx.peer_scheduler("scheduler-b");
    let due = entry.next_run_at + ChronoDuration::seconds(1);

    let (ra, rb) = tokio::join!(a.tick(due), b.tick(due));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.enqueued() + rb.enqueued(), 1);
    assert!(ra.leader != rb.leader);
    assert_eq!(ctx.broker.queue_depth("default").await.unwrap().ready, 1);

    let advanced = ctx.scheduler.get("metrics").await.unwrap();
    assert_eq!(advanced.last_run_at, Some(entry.next_run_at));
    assert!(advanced.next_run_at > due);
}

/// A released lease hands leadership to the peer.
#[tokio::test]
async fn test_leadership_handover() {
    let ctx = TestContext::new().await;
    let entry = ctx
        .scheduler
        .create(every_minute("metrics", "persist_metrics"))
        .await
        .unwrap();

    let a = ctx.scheduler.clone();
    let b = ctx.peer_scheduler("scheduler-b");
    let now = Utc::now();

    assert!(a.tick(now).await.unwrap().leader);
    assert!(!b.tick(now).await.unwrap().leader);

    a.release().await;

    let due = entry.next_run_at + ChronoDuration::seconds(1);
    let report = b.tick(due).await.unwrap();
    assert!(report.leader);
    assert_eq!(report.enqueued(), 1);

    let status = b.status().await.unwrap();
    assert!(status.leader);
    assert_eq!(status.instance_id, "scheduler-b");
}

/// A fired occurrence runs through the pool like any other task.
#[tokio::test]
async fn test_scheduled_task_runs() {
    let ctx = TestContext::new().await;
    let _pool = ctx.start_pool();

    let entry = ctx
        .scheduler
        .create(every_minute("metrics", "persist_metrics"))
        .await
        .unwrap();
    let report = ctx
        .scheduler
        .tick(entry.next_run_at + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.fired, vec!["metrics".to_string()]);

    let store = ctx.store.clone();
    assert!(ctx.eventually(Duration::from_secs(5), || store.snapshot_count() == 1).await);
}
