//! Task producer: the enqueue side of the job API.

use crate::handler::HandlerRegistry;
use crate::results::ResultStore;
use broker::Broker;
use chrono::{DateTime, Utc};
use engine_core::limits::{DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RETRIES};
use engine_core::{Error, Result, RetryPolicy, TaskId, TaskMessage, TaskResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics;
use tracing::{debug, error, warn};

/// Per-call enqueue options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retries: Option<u32>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: None,
            priority: DEFAULT_PRIORITY,
            eta: None,
            retries: None,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// Builds task messages, records their pending result, and enqueues them.
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
    results: Arc<ResultStore>,
    lanes: Vec<String>,
    registry: Option<Arc<HandlerRegistry>>,
    retry: RetryPolicy,
}

impl TaskProducer {
    pub fn new(broker: Arc<dyn Broker>, results: Arc<ResultStore>, lanes: Vec<String>) -> Self {
        Self {
            broker,
            results,
            lanes,
            registry: None,
            retry: RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1)),
        }
    }

    /// Reject task types with no registered handler at enqueue time.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Retry policy for broker outages during enqueue.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn lanes(&self) -> &[String] {
        &self.lanes
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn results(&self) -> &Arc<ResultStore> {
        &self.results
    }

    /// Enqueue a task and return its id.
    pub async fn enqueue(
        &self,
        task_type: &str,
        args: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<TaskId> {
        if let Some(registry) = &self.registry {
            if !registry.contains(task_type) {
                return Err(Error::UnknownTaskType(task_type.to_string()));
            }
        }

        let message = TaskMessage::new(task_type, args)
            .with_queue(options.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()))
            .with_priority(options.priority)
            .with_retries(options.retries.unwrap_or(DEFAULT_RETRIES))
            .with_eta(options.eta);

        self.enqueue_message(&message).await?;
        Ok(message.id)
    }

    /// Enqueue a prepared message.
    ///
    /// The pending result is written first so a worker that picks the
    /// message up immediately never has its status overwritten.
    pub async fn enqueue_message(&self, message: &TaskMessage) -> Result<()> {
        if !self.lanes.iter().any(|l| *l == message.queue) {
            return Err(Error::validation(format!(
                "unknown queue '{}' (lanes: {})",
                message.queue,
                self.lanes.join(", ")
            )));
        }

        let start = Instant::now();
        self.results.mark_pending(message).await;

        let mut attempt = 0;
        loop {
            match self.broker.enqueue(message).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    metrics().broker_errors.inc();
                    let delay = self.retry.backoff(attempt);
                    warn!(task_id = %message.id, attempt, delay_ms = %delay.as_millis(), error = %e, "Enqueue failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        metrics().broker_errors.inc();
                    }
                    error!(task_id = %message.id, task_type = %message.task_type, error = %e, "Enqueue failed");
                    self.results.remove(message.id).await;
                    return Err(e);
                }
            }
        }

        metrics().tasks_enqueued.inc();
        metrics()
            .enqueue_latency_ms
            .observe(start.elapsed().as_millis() as u64);
        debug!(task_id = %message.id, task_type = %message.task_type, queue = %message.queue, "Task enqueued");
        Ok(())
    }

    pub async fn get_result(&self, id: TaskId) -> Result<TaskResult> {
        self.results
            .get(id)
            .await
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultStoreConfig;
    use broker::MemoryBroker;
    use engine_core::TaskStatus;

    fn producer(broker: Arc<MemoryBroker>) -> TaskProducer {
        TaskProducer::new(
            broker,
            Arc::new(ResultStore::new(ResultStoreConfig::default())),
            vec!["critical".into(), "default".into()],
        )
        .with_retry(RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn test_enqueue_writes_pending_result() {
        let broker = Arc::new(MemoryBroker::default());
        let producer = producer(broker.clone());

        let id = producer
            .enqueue(
                "send_email",
                serde_json::json!({"to": "a@b.c"}),
                EnqueueOptions::default().retries(5).priority(3),
            )
            .await
            .unwrap();

        let result = producer.get_result(id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Pending);

        let message = broker
            .dequeue("default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
            .message;
        assert_eq!(message.id, id);
        assert_eq!(message.retries_remaining, 5);
        assert_eq!(message.priority, 3);
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let producer = producer(Arc::new(MemoryBroker::default()));
        let err = producer
            .enqueue("noop", serde_json::Value::Null, EnqueueOptions::default().queue("bulk"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_unregistered_task_type_rejected() {
        let producer = producer(Arc::new(MemoryBroker::default()))
            .with_registry(Arc::new(HandlerRegistry::new()));
        let err = producer
            .enqueue("noop", serde_json::Value::Null, EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTaskType(_)));
    }

    #[tokio::test]
    async fn test_broker_outage_surfaces_after_retries() {
        let broker = Arc::new(MemoryBroker::default());
        broker.set_available(false);
        let producer = producer(broker);

        let message = TaskMessage::new("noop", serde_json::Value::Null);
        let err = producer.enqueue_message(&message).await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)));
        assert!(matches!(
            producer.get_result(message.id).await,
            Err(Error::TaskNotFound(_))
        ));
    }
}
