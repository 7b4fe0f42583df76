//! Schedule register endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine_core::ScheduleEntry;
use tracing::info;
use worker::{NewSchedule, ScheduleUpdate};

use crate::extractors::ApiJson;
use crate::response::ApiError;
use crate::state::AppState;

/// GET /schedules
pub async fn list_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduleEntry>>, ApiError> {
    Ok(Json(state.scheduler.list().await?))
}

/// GET /schedules/:name
pub async fn get_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    Ok(Json(state.scheduler.get(&name).await?))
}

/// POST /schedules - Register a new entry.
pub async fn create_handler(
    State(state): State<AppState>,
    ApiJson(schedule): ApiJson<NewSchedule>,
) -> Result<(StatusCode, Json<ScheduleEntry>), ApiError> {
    let entry = state.scheduler.create(schedule).await?;
    info!(name = %entry.name, task_type = %entry.task_type, next_run_at = %entry.next_run_at, "Schedule created");
    Ok((StatusCode::CREATED, Json(entry)))
}

/// PUT /schedules/:name - Change cadence, payload, or routing.
pub async fn update_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiJson(update): ApiJson<ScheduleUpdate>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    Ok(Json(state.scheduler.update(&name, update).await?))
}

/// POST /schedules/:name/enable
pub async fn enable_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    Ok(Json(state.scheduler.set_enabled(&name, true).await?))
}

/// POST /schedules/:name/disable
pub async fn disable_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleEntry>, ApiError> {
    Ok(Json(state.scheduler.set_enabled(&name, false).await?))
}
