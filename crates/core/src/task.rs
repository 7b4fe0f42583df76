//! Task messages and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::{DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RETRIES};

/// Unique task identifier.
pub type TaskId = Uuid;

/// A unit of work travelling through the broker.
///
/// Messages are never mutated in place. A retry produces a fresh copy via
/// [`TaskMessage::next_attempt`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub queue: String,
    pub task_type: String,
    /// Opaque serialized arguments.
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest execution time.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    #[serde(default)]
    pub priority: u8,
    /// Completed execution attempts.
    #[serde(default)]
    pub attempt: u32,
}

impl TaskMessage {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: DEFAULT_QUEUE.to_string(),
            task_type: task_type.into(),
            payload,
            enqueued_at: Utc::now(),
            eta: None,
            retries_remaining: DEFAULT_RETRIES,
            priority: DEFAULT_PRIORITY,
            attempt: 0,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_eta(mut self, eta: Option<DateTime<Utc>>) -> Self {
        self.eta = eta;
        self
    }

    /// Whether the message may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.eta.map_or(true, |eta| eta <= now)
    }

    /// Copy for the next attempt after a failed one.
    ///
    /// Returns `None` when no retries remain.
    pub fn next_attempt(&self, eta: DateTime<Utc>) -> Option<Self> {
        let retries_remaining = self.retries_remaining.checked_sub(1)?;
        Some(Self {
            retries_remaining,
            attempt: self.attempt + 1,
            eta: Some(eta),
            ..self.clone()
        })
    }

    /// Encode for the wire.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Task lifecycle status as seen by producers and the monitor.
///
/// Maps the worker state machine: `enqueued` is `Pending`, `in_flight` is
/// `Started`, `retrying` is `Retry`, `dead` is `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Outcome record kept in the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn pending(message: &TaskMessage) -> Self {
        Self {
            task_id: message.id,
            task_type: message.task_type.clone(),
            queue: message.queue.clone(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempts: message.attempt,
            started_at: None,
            finished_at: None,
            updated_at: Utc::now(),
        }
    }
}
