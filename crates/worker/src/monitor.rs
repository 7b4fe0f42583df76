//! Read-only view over queues, workers, results, and ingestion.

use crate::pool::{PoolStats, WorkerPool};
use crate::results::ResultStore;
use crate::scheduler::{Scheduler, SchedulerStatus};
use broker::{Broker, DeadLetter};
use chrono::{DateTime, Utc};
use engine_core::limits::DEAD_LETTER_QUEUE;
use engine_core::TaskResult;
use ingest::{IngestionPipeline, PipelineStats};
use serde::Serialize;
use std::sync::Arc;
use telemetry::{metrics, MetricsSnapshot};
use tracing::warn;

const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct LaneDepth {
    pub queue: String,
    pub ready: usize,
    pub delayed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub generated_at: DateTime<Utc>,
    pub broker_reachable: bool,
    pub queues: Vec<LaneDepth>,
    pub in_flight: usize,
    pub dead_letter_count: usize,
    pub dead_letters: Vec<DeadLetter>,
    pub workers: Option<PoolStats>,
    pub scheduler: Option<SchedulerStatus>,
    pub results_stored: u64,
    pub recent_results: Vec<TaskResult>,
    pub ingestion: Option<PipelineStats>,
    pub metrics: MetricsSnapshot,
}

pub struct Monitor {
    broker: Arc<dyn Broker>,
    lanes: Vec<String>,
    results: Arc<ResultStore>,
    pool: Option<Arc<WorkerPool>>,
    scheduler: Option<Arc<Scheduler>>,
    pipeline: Option<Arc<IngestionPipeline>>,
}

impl Monitor {
    pub fn new(broker: Arc<dyn Broker>, lanes: Vec<String>, results: Arc<ResultStore>) -> Self {
        Self {
            broker,
            lanes,
            results,
            pool: None,
            scheduler: None,
            pipeline: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<IngestionPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Collect a snapshot. Broker failures are reported, not propagated.
    pub async fn snapshot(&self, limit: Option<usize>) -> MonitorSnapshot {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let mut broker_reachable = true;

        let mut queues = Vec::with_capacity(self.lanes.len());
        for lane in &self.lanes {
            match self.broker.queue_depth(lane).await {
                Ok(depth) => queues.push(LaneDepth {
                    queue: lane.clone(),
                    ready: depth.ready,
                    delayed: depth.delayed,
                }),
                Err(e) => {
                    warn!(queue = %lane, error = %e, "Queue depth unavailable");
                    broker_reachable = false;
                    break;
                }
            }
        }

        let (in_flight, dead_letter_count, dead_letters) = if broker_reachable {
            let in_flight = self.broker.in_flight_count().await.unwrap_or_default();
            let dead_count = self
                .broker
                .queue_depth(DEAD_LETTER_QUEUE)
                .await
                .map(|d| d.ready)
                .unwrap_or_default();
            let dead = self.broker.dead_letters(limit).await.unwrap_or_default();
            (in_flight, dead_count, dead)
        } else {
            (0, 0, Vec::new())
        };

        let scheduler = match &self.scheduler {
            Some(scheduler) => match scheduler.status().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(error = %e, "Scheduler status unavailable");
                    None
                }
            },
            None => None,
        };

        MonitorSnapshot {
            generated_at: Utc::now(),
            broker_reachable,
            queues,
            in_flight,
            dead_letter_count,
            dead_letters,
            workers: self.pool.as_ref().map(|p| p.stats()),
            scheduler,
            results_stored: self.results.entry_count(),
            recent_results: self.results.recent(limit).await,
            ingestion: self.pipeline.as_ref().map(|p| p.stats()),
            metrics: metrics().snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultStoreConfig;
    use broker::{MemoryBroker, Nack};
    use engine_core::TaskMessage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_snapshot_counts() {
        let broker = Arc::new(MemoryBroker::default());
        let results = Arc::new(ResultStore::new(ResultStoreConfig::default()));
        let monitor = Monitor::new(
            broker.clone(),
            vec!["critical".into(), "default".into()],
            results.clone(),
        );

        for n in 0..3 {
            let message = TaskMessage::new("noop", serde_json::json!(n));
            results.mark_pending(&message).await;
            broker.enqueue(&message).await.unwrap();
        }
        let doomed = broker
            .dequeue("default", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        broker
            .nack(doomed.receipt, Nack::DeadLetter { reason: "bad".into() })
            .await
            .unwrap();
        broker.dequeue("default", Duration::from_secs(30)).await.unwrap();

        let snapshot = monitor.snapshot(None).await;
        assert!(snapshot.broker_reachable);
        assert_eq!(snapshot.queues.len(), 2);
        assert_eq!(snapshot.queues[1].ready, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.dead_letter_count, 1);
        assert_eq!(snapshot.dead_letters[0].reason, "bad");
        assert_eq!(snapshot.recent_results.len(), 3);
        assert!(snapshot.workers.is_none());
        assert!(snapshot.ingestion.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_with_broker_down() {
        let broker = Arc::new(MemoryBroker::default());
        broker.set_available(false);
        let monitor = Monitor::new(
            broker,
            vec!["default".into()],
            Arc::new(ResultStore::new(ResultStoreConfig::default())),
        );

        let snapshot = monitor.snapshot(Some(5)).await;
        assert!(!snapshot.broker_reachable);
        assert!(snapshot.queues.is_empty());
    }
}
