//! Task submission and result lookup.

use axum::{extract::State, http::StatusCode, Json};
use engine_core::TaskResult;
use serde::Deserialize;
use tracing::debug;
use worker::EnqueueOptions;

use crate::extractors::{ApiJson, TaskIdPath};
use crate::response::{ApiError, TaskAccepted};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitTask {
    pub task_type: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(flatten)]
    pub options: EnqueueOptions,
}

/// POST /tasks - Enqueue a task.
pub async fn submit_handler(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<SubmitTask>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    if request.task_type.trim().is_empty() {
        return Err(ApiError::validation(vec!["task_type must not be empty".into()]));
    }

    let task_id = state
        .producer
        .enqueue(&request.task_type, request.args, request.options)
        .await?;

    debug!(task_id = %task_id, task_type = %request.task_type, "Task accepted");
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted::pending(task_id))))
}

/// GET /tasks/:id - Current status and outcome of a task.
pub async fn result_handler(
    State(state): State<AppState>,
    TaskIdPath(task_id): TaskIdPath,
) -> Result<Json<TaskResult>, ApiError> {
    Ok(Json(state.producer.get_result(task_id).await?))
}
