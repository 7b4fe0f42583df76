//! Application state shared across handlers.

use ingest::IngestionPipeline;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use worker::{Monitor, MonitorSnapshot, Scheduler, TaskProducer};

/// Monitor snapshots are reused for this long.
const SNAPSHOT_CACHE_TTL: Duration = Duration::from_secs(1);

/// One entry per distinct `limit` query value.
const SNAPSHOT_CACHE_MAX_CAPACITY: u64 = 64;

/// Monitor view with a short-lived snapshot cache, so dashboards polling
/// `/monitor` do not walk every lane on each request.
#[derive(Clone)]
pub struct MonitorView {
    monitor: Arc<Monitor>,
    cache: Option<Cache<Option<usize>, Arc<MonitorSnapshot>>>,
}

impl MonitorView {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self::with_ttl(monitor, SNAPSHOT_CACHE_TTL)
    }

    /// A zero TTL disables caching.
    pub fn with_ttl(monitor: Arc<Monitor>, ttl: Duration) -> Self {
        let cache = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(SNAPSHOT_CACHE_MAX_CAPACITY)
                .time_to_live(ttl)
                .build()
        });
        Self { monitor, cache }
    }

    pub async fn snapshot(&self, limit: Option<usize>) -> Arc<MonitorSnapshot> {
        let Some(cache) = &self.cache else {
            return Arc::new(self.monitor.snapshot(limit).await);
        };

        if let Some(cached) = cache.get(&limit).await {
            debug!("Monitor snapshot cache hit");
            return cached;
        }

        let snapshot = Arc::new(self.monitor.snapshot(limit).await);
        cache.insert(limit, snapshot.clone()).await;
        snapshot
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Enqueue side of the job API, also the result lookup
    pub producer: Arc<TaskProducer>,
    /// Schedule register and leader loop
    pub scheduler: Arc<Scheduler>,
    /// Batched ingestion into the columnar store
    pub pipeline: Arc<IngestionPipeline>,
    pub monitor: MonitorView,
}

impl AppState {
    pub fn new(
        producer: Arc<TaskProducer>,
        scheduler: Arc<Scheduler>,
        pipeline: Arc<IngestionPipeline>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            producer,
            scheduler,
            pipeline,
            monitor: MonitorView::new(monitor),
        }
    }

    /// Replace the monitor cache TTL.
    pub fn with_monitor_ttl(mut self, ttl: Duration) -> Self {
        self.monitor = MonitorView::with_ttl(self.monitor.monitor.clone(), ttl);
        self
    }
}
