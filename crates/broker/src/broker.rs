//! The broker channel abstraction.
//!
//! A broker carries serialized task messages between producers and the
//! worker pool. Delivery is at-least-once: a dequeued message is hidden
//! from other consumers until it is acked, nacked, or its visibility
//! timeout elapses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_core::{Result, TaskId, TaskMessage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Proof of one particular delivery of a message.
///
/// Every dequeue of a message mints a new receipt. Once the visibility
/// timeout hands the message to another consumer, the earlier receipt is
/// stale and can no longer settle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub id: TaskId,
    pub delivery: u64,
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.delivery)
    }
}

/// A dequeued message together with the receipt that settles it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    pub receipt: Receipt,
}

/// Whether an ack, nack, or extension took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    /// The receipt no longer owns the message (redelivered or settled).
    Stale,
}

impl Settlement {
    pub fn is_applied(self) -> bool {
        self == Settlement::Applied
    }
}

/// What to do with a message the consumer did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Nack {
    /// Make the message visible again immediately, unchanged.
    Requeue,
    /// Replace the message with an updated copy (new eta and retry count).
    Retry(TaskMessage),
    /// Route the message to the dead-letter queue.
    DeadLetter { reason: String },
}

/// A message that exhausted its retries or could not be processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Messages waiting in one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Visible and due.
    pub ready: usize,
    /// Held until their eta.
    pub delayed: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed
    }
}

/// Broker channel operations.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to its lane.
    async fn enqueue(&self, message: &TaskMessage) -> Result<()>;

    /// Take the next due message from `queue`, hiding it for
    /// `visibility_timeout`.
    async fn dequeue(&self, queue: &str, visibility_timeout: Duration)
        -> Result<Option<Delivery>>;

    /// Remove a delivered message permanently.
    async fn ack(&self, receipt: Receipt) -> Result<Settlement>;

    /// Hand a delivered message back.
    async fn nack(&self, receipt: Receipt, disposition: Nack) -> Result<Settlement>;

    /// Push the visibility deadline of a delivery out to
    /// `now + visibility_timeout`.
    async fn extend(&self, receipt: Receipt, visibility_timeout: Duration) -> Result<Settlement>;

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth>;

    /// Messages delivered but not yet acked or nacked.
    async fn in_flight_count(&self) -> Result<usize>;

    /// Most recent dead letters, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Reachability check.
    async fn ping(&self) -> Result<()>;
}

/// Dequeue with strict priority: lanes are tried in order and a lower lane
/// is only consulted when every lane before it is empty.
pub async fn dequeue_prioritized(
    broker: &dyn Broker,
    lanes: &[String],
    visibility_timeout: Duration,
) -> Result<Option<Delivery>> {
    for lane in lanes {
        if let Some(delivery) = broker.dequeue(lane, visibility_timeout).await? {
            return Ok(Some(delivery));
        }
    }
    Ok(None)
}
