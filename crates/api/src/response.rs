//! Standardized API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine_core::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use telemetry::ComponentHealthReport;

/// Seconds a client is told to wait after ingestion backpressure.
const BACKPRESSURE_RETRY_AFTER_SECS: u64 = 1;

/// Returned by `POST /tasks`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

impl TaskAccepted {
    pub fn pending(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
        }
    }
}

/// Success response for ingestion.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    pub received: usize,
    /// Buffer occupancy after the records were appended
    pub occupancy: usize,
    pub timestamp: i64,
}

impl IngestResponse {
    pub fn accepted(received: usize, occupancy: usize) -> Self {
        Self {
            success: true,
            received,
            occupancy,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub broker_connected: bool,
    pub store_connected: bool,
    pub scheduler_alive: bool,
    pub buffered_records: usize,
    pub components: Vec<ComponentHealthReport>,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = Some(details);
        self
    }
}

/// API error carrying the engine's error code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
    pub retry_after: Option<u64>,
}

impl ApiError {
    pub fn with_code(status: StatusCode, code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status,
            response: ErrorResponse::new(msg, code),
            retry_after: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::BAD_REQUEST, "VALID_001", msg)
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::PAYLOAD_TOO_LARGE, "VALID_002", msg)
    }

    pub fn backpressure(msg: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            response: ErrorResponse::new(msg, "INGEST_001"),
            retry_after,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg)
    }

    pub fn validation(errors: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            response: ErrorResponse::new("Validation failed", "VALID_001").with_details(errors),
            retry_after: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.response)).into_response();

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

impl From<engine_core::Error> for ApiError {
    fn from(err: engine_core::Error) -> Self {
        match &err {
            engine_core::Error::Backpressure { .. } => {
                ApiError::backpressure(err.to_string(), Some(BACKPRESSURE_RETRY_AFTER_SECS))
            }
            engine_core::Error::Validation(msg) => ApiError::validation(vec![msg.clone()]),
            _ => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                ApiError::with_code(status, err.code(), err.to_string())
            }
        }
    }
}
