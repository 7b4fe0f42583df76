//! Monitor endpoint.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use worker::MonitorSnapshot;

use crate::state::AppState;

/// Upper bound on recent results and dead letters per snapshot.
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct MonitorQuery {
    pub limit: Option<usize>,
}

/// GET /monitor - Queue depths, worker activity, recent results, and
/// ingestion state.
pub async fn monitor_handler(
    State(state): State<AppState>,
    Query(query): Query<MonitorQuery>,
) -> Json<MonitorSnapshot> {
    let limit = query.limit.map(|l| l.min(MAX_LIMIT));
    let snapshot = state.monitor.snapshot(limit).await;
    Json(MonitorSnapshot::clone(&snapshot))
}
