//! End-to-end task tests: submit over HTTP, execute in the real pool,
//! read the outcome back over HTTP.

use axum::http::StatusCode;
use engine_core::{Error, TaskId, TaskStatus};
use integration_tests::fixtures::{task_request, tick_records};
use integration_tests::setup::TestContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn task_id(body: &serde_json::Value) -> TaskId {
    body["task_id"].as_str().unwrap().parse().unwrap()
}

/// A handler that fails twice then succeeds finishes on its third attempt.
#[tokio::test]
async fn test_send_email_succeeds_after_two_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let ctx = TestContext::with_handlers(move |registry| {
        registry
            .register_fn("send_email", move |_ctx, args| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        return Err(Error::handler(format!("smtp timeout #{}", n + 1)));
                    }
                    Ok::<_, Error>(serde_json::json!({ "sent_to": args["to"] }))
                }
            })
            .unwrap();
    })
    .await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    let mut request = task_request("send_email", serde_json::json!({ "to": "ops@example.com" }));
    request["retries"] = serde_json::json!(3);

    let response = server.post("/tasks").json(&request).await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "pending");
    let id = task_id(&body);

    let result = ctx.wait_for_terminal(id, WAIT).await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let response = server.get(&format!("/tasks/{}", id)).await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"]["sent_to"], "ops@example.com");
    assert_eq!(body["attempts"], 3);
}

/// N retries means N+1 attempts, then the dead-letter queue.
#[tokio::test]
async fn test_retries_exhausted_dead_letters() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let ctx = TestContext::with_handlers(move |registry| {
        registry
            .register_fn("always_fails", move |_ctx, _args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<serde_json::Value, _>(Error::handler("upstream down"))
                }
            })
            .unwrap();
    })
    .await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    let mut request = task_request("always_fails", serde_json::json!({}));
    request["retries"] = serde_json::json!(2);
    let body: serde_json::Value = server.post("/tasks").json(&request).await.json();
    let id = task_id(&body);

    let result = ctx.wait_for_terminal(id, WAIT).await;
    assert_eq!(result.status, TaskStatus::Failure);
    assert_eq!(result.attempts, 3);
    assert!(result.error.unwrap().contains("upstream down"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = broker::Broker::dead_letters(ctx.broker.as_ref(), 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.id, id);
}

/// Arguments that do not decode fail once, without retry.
#[tokio::test]
async fn test_undecodable_args_fail_without_retry() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    let body: serde_json::Value = server
        .post("/tasks")
        .json(&task_request("ingest_records", serde_json::json!({ "rows": [] })))
        .await
        .json();

    let result = ctx.wait_for_terminal(task_id(&body), WAIT).await;
    assert_eq!(result.status, TaskStatus::Failure);
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn test_ingest_records_task_reaches_store() {
    let ctx = TestContext::new().await;
    let server = ctx.server();
    let _pool = ctx.start_pool();

    let records = serde_json::to_value(tick_records(25)).unwrap();
    let body: serde_json::Value = server
        .post("/tasks")
        .json(&task_request("ingest_records", serde_json::json!({ "records": records })))
        .await
        .json();

    let result = ctx.wait_for_terminal(task_id(&body), WAIT).await;
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.result.unwrap()["accepted"], 25);

    assert_eq!(ctx.pipeline.flush().await, 25);
    assert_eq!(ctx.store.record_count(), 25);
}

#[tokio::test]
async fn test_unknown_task_type_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server
        .post("/tasks")
        .json(&task_request("launch_rockets", serde_json::json!({})))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "TASK_003");
}

#[tokio::test]
async fn test_unknown_queue_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let mut request = task_request("persist_metrics", serde_json::json!({}));
    request["queue"] = serde_json::json!("bulk");

    let response = server.post("/tasks").json(&request).await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_task_body_rejected() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server
        .post("/tasks")
        .json(&serde_json::json!({ "args": {} }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "VALID_001");
}

#[tokio::test]
async fn test_task_lookup_errors() {
    let ctx = TestContext::new().await;
    let server = ctx.server();

    let response = server.get("/tasks/not-a-uuid").await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = server.get(&format!("/tasks/{}", uuid::Uuid::new_v4())).await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "TASK_404");
}

/// Every enqueued task runs exactly once when nothing fails.
#[tokio::test]
async fn test_each_task_delivered_once() {
    let seen: Arc<Mutex<HashMap<TaskId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let recorder = seen.clone();
    let ctx = TestContext::with_handlers(move |registry| {
        registry
            .register_fn("record", move |ctx, _args| {
                let recorder = recorder.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    *recorder.lock().entry(ctx.task_id).or_default() += 1;
                    Ok::<_, Error>(serde_json::Value::Null)
                }
            })
            .unwrap();
    })
    .await;
    let _pool = ctx.start_pool();

    let mut ids = Vec::new();
    for n in 0..60 {
        let queue = ["critical", "default", "low"][n % 3];
        let id = ctx
            .producer
            .enqueue(
                "record",
                serde_json::json!({ "n": n }),
                worker::EnqueueOptions::default().queue(queue),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    for id in &ids {
        let result = ctx.wait_for_terminal(*id, WAIT).await;
        assert_eq!(result.status, TaskStatus::Success);
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), ids.len());
    assert!(seen.values().all(|&count| count == 1));
}
