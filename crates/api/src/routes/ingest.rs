//! Ingestion endpoint handler.
//!
//! Accepts time-series records in two formats:
//! 1. Line protocol (any non-JSON content type), one record per line
//! 2. JSON array of records (`Content-Type: application/json`)
//!
//! Records go straight to the ingestion buffer. A full buffer answers 429
//! with `Retry-After` and keeps none of the request's records.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use engine_core::{limits::MAX_INGEST_BODY_BYTES, Record};
use ingest::line_protocol;
use std::time::Instant;
use tracing::{debug, warn};

use crate::response::{ApiError, IngestResponse};
use crate::state::AppState;

/// POST /ingest - Submit records to the ingestion pipeline.
pub async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let start = Instant::now();

    if body.len() > MAX_INGEST_BODY_BYTES {
        return Err(ApiError::payload_too_large(format!(
            "Payload size {}KB exceeds {}KB limit",
            body.len() / 1024,
            MAX_INGEST_BODY_BYTES / 1024
        )));
    }

    let records = if is_json(&headers) {
        serde_json::from_slice::<Vec<Record>>(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid record array: {}", e)))?
    } else {
        let text = std::str::from_utf8(&body)
            .map_err(|_| ApiError::bad_request("line protocol body must be UTF-8"))?;
        line_protocol::parse(text, Utc::now())?
    };

    if records.is_empty() {
        return Err(ApiError::validation(vec!["no records in request".into()]));
    }

    let received = records.len();
    let occupancy = state.pipeline.submit_many(records).map_err(|e| {
        warn!(records = received, error = %e, "Ingest request refused");
        ApiError::from(e)
    })?;

    debug!(
        records = received,
        occupancy,
        latency_us = start.elapsed().as_micros() as u64,
        "Ingest request accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse::accepted(received, occupancy)),
    ))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}
