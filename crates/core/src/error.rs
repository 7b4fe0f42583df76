//! Unified error types for the jobs engine.
//!
//! Error codes:
//! - BROKER_001: Broker unavailable
//! - SERDE_001: Payload could not be encoded or decoded
//! - TASK_001-004: Task execution errors
//! - INGEST_001-003: Ingestion errors
//! - SCHED_001-003: Scheduler errors

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the jobs engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport cannot accept reads or writes.
    #[error("[BROKER_001] broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Payload malformed; fatal for the message that carries it.
    #[error("[SERDE_001] serialization error: {0}")]
    Serialization(String),

    /// Task logic raised a recoverable failure.
    #[error("[TASK_001] handler failure: {0}")]
    HandlerFailure(String),

    /// Task exceeded its deadline and was cancelled cooperatively.
    #[error("[TASK_002] deadline exceeded after {}ms", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("[TASK_003] no handler registered for task type '{0}'")]
    UnknownTaskType(String),

    #[error("[TASK_004] handler already registered for task type '{0}'")]
    DuplicateHandler(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Ingestion buffer is at or above its high-water mark.
    #[error("[INGEST_001] ingestion buffer full ({occupancy}/{high_water})")]
    Backpressure { occupancy: usize, high_water: usize },

    /// Ingestion flush could not be written to the store.
    #[error("[INGEST_002] store write failure: {0}")]
    StoreWriteFailure(String),

    #[error("[INGEST_003] spill failure: {0}")]
    Spill(String),

    /// Scheduler lease is held by another instance.
    #[error("[SCHED_001] lease '{key}' held by {holder}")]
    LockContention { key: String, holder: String },

    #[error("[SCHED_002] schedule entry not found: {0}")]
    ScheduleNotFound(String),

    #[error("[SCHED_003] invalid cadence '{expr}': {message}")]
    InvalidCadence { expr: String, message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn broker_unavailable(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerFailure(msg.into())
    }

    pub fn store_write(msg: impl Into<String>) -> Self {
        Self::StoreWriteFailure(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BrokerUnavailable(_) => "BROKER_001",
            Self::Serialization(_) => "SERDE_001",
            Self::HandlerFailure(_) => "TASK_001",
            Self::DeadlineExceeded(_) => "TASK_002",
            Self::UnknownTaskType(_) => "TASK_003",
            Self::DuplicateHandler(_) => "TASK_004",
            Self::TaskNotFound(_) => "TASK_404",
            Self::Backpressure { .. } => "INGEST_001",
            Self::StoreWriteFailure(_) => "INGEST_002",
            Self::Spill(_) => "INGEST_003",
            Self::LockContention { .. } => "SCHED_001",
            Self::ScheduleNotFound(_) => "SCHED_002",
            Self::InvalidCadence { .. } => "SCHED_003",
            Self::Validation(_) => "VALID_001",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BrokerUnavailable(_) => 503,
            Self::Serialization(_) => 400,
            Self::HandlerFailure(_) => 500,
            Self::DeadlineExceeded(_) => 504,
            Self::UnknownTaskType(_) => 400,
            Self::DuplicateHandler(_) => 409,
            Self::TaskNotFound(_) => 404,
            Self::Backpressure { .. } => 429,
            Self::StoreWriteFailure(_) => 503,
            Self::Spill(_) => 500,
            Self::LockContention { .. } => 409,
            Self::ScheduleNotFound(_) => 404,
            Self::InvalidCadence { .. } => 400,
            Self::Validation(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a task attempt that failed with this error may be retried.
    ///
    /// Data errors (malformed payload, unknown type) go straight to the
    /// dead-letter path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandlerFailure(_)
                | Self::DeadlineExceeded(_)
                | Self::BrokerUnavailable(_)
                | Self::StoreWriteFailure(_)
                | Self::Backpressure { .. }
                | Self::Internal(_)
        )
    }

    /// Transient transport/storage errors, retried locally with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::StoreWriteFailure(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_status() {
        let err = Error::Backpressure {
            occupancy: 10,
            high_water: 10,
        };
        assert_eq!(err.code(), "INGEST_001");
        assert_eq!(err.http_status(), 429);
        assert!(err.to_string().contains("10/10"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::handler("boom").is_retryable());
        assert!(Error::DeadlineExceeded(Duration::from_secs(1)).is_retryable());
        assert!(!Error::serialization("bad json").is_retryable());
        assert!(!Error::UnknownTaskType("x".into()).is_retryable());
        assert!(Error::broker_unavailable("down").is_transient());
        assert!(!Error::handler("boom").is_transient());
    }
}
