//! Common test setup functions.

use api::{router, AppState};
use axum::Router;
use axum_test::TestServer;
use broker::{BrokerConfig, MemoryBroker, MemoryLeaseStore};
use engine_core::{RetryPolicy, TaskId, TaskResult};
use ingest::{FailurePolicy, IngestionPipeline, PipelineConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{
    register_builtin, HandlerRegistry, MemoryScheduleStore, Monitor, PoolConfig, ResultStore,
    ResultStoreConfig, Scheduler, SchedulerConfig, TaskProducer, WorkerPool,
};

use crate::mocks::MockStore;

/// Knobs the integration tests turn.
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Ingestion buffer high-water mark
    pub high_water: usize,
    /// Records per flushed batch
    pub batch_size: usize,
    /// Backoff between task attempts
    pub task_retry: RetryPolicy,
    pub task_deadline: Duration,
    pub visibility_timeout: Duration,
    pub concurrency: usize,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            high_water: 10_000,
            batch_size: 100,
            task_retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
            task_deadline: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            concurrency: 8,
        }
    }
}

/// Test context with the in-memory broker and a mock columnar store.
///
/// This provides the same production code paths by:
/// - Using the real Axum router with all layers
/// - Using the real pool, scheduler, producer, and pipeline
/// - Using MockStore which implements the ColumnarStore trait
pub struct TestContext {
    pub broker: Arc<MemoryBroker>,
    pub leases: Arc<MemoryLeaseStore>,
    pub results: Arc<ResultStore>,
    pub registry: Arc<HandlerRegistry>,
    pub producer: Arc<TaskProducer>,
    pub schedules: Arc<MemoryScheduleStore>,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<WorkerPool>,
    pub pipeline: Arc<IngestionPipeline>,
    pub store: Arc<MockStore>,
    pub router: Router,
    pub cancel: CancellationToken,
    pub options: TestOptions,
    _spill_dir: TempDir,
}

impl TestContext {
    /// Context with only the built-in tasks registered.
    pub async fn new() -> Self {
        Self::build(TestOptions::default(), |_| {}).await
    }

    /// Context with extra handlers registered by `configure`.
    pub async fn with_handlers(configure: impl FnOnce(&mut HandlerRegistry)) -> Self {
        Self::build(TestOptions::default(), configure).await
    }

    pub async fn build(options: TestOptions, configure: impl FnOnce(&mut HandlerRegistry)) -> Self {
        let spill_dir = tempfile::tempdir().expect("Failed to create spill dir");
        let broker_config = BrokerConfig {
            visibility_timeout_ms: options.visibility_timeout.as_millis() as u64,
            ..BrokerConfig::default()
        };
        let lanes = broker_config.lanes.clone();

        let broker = Arc::new(MemoryBroker::new(broker_config));
        let leases = Arc::new(MemoryLeaseStore::new());
        let store = Arc::new(MockStore::new());

        let pipeline = Arc::new(IngestionPipeline::new(
            PipelineConfig {
                max_size: options.batch_size,
                max_wait_ms: 50,
                high_water: options.high_water,
                flush_timeout_ms: 1000,
                flush_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(5)),
                on_failure: FailurePolicy::Spill,
                spill_dir: spill_dir.path().to_path_buf(),
            },
            store.clone(),
        ));

        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry, pipeline.clone(), store.clone())
            .expect("Failed to register built-in tasks");
        configure(&mut registry);
        let registry = Arc::new(registry);

        let results = Arc::new(ResultStore::new(ResultStoreConfig::default()));
        let producer = Arc::new(
            TaskProducer::new(broker.clone(), results.clone(), lanes.clone())
                .with_registry(registry.clone()),
        );

        let schedules = Arc::new(MemoryScheduleStore::new());
        let scheduler = Arc::new(
            Scheduler::new(
                scheduler_config("scheduler-a"),
                schedules.clone(),
                leases.clone(),
                producer.clone(),
            )
            .with_registry(registry.clone()),
        );

        let pool = Arc::new(WorkerPool::new(
            PoolConfig {
                concurrency: options.concurrency,
                lanes: lanes.clone(),
                task_deadline_ms: options.task_deadline.as_millis() as u64,
                retry: options.task_retry,
                poll_interval_ms: 5,
                dead_letter: true,
                shutdown_timeout_ms: 1000,
            },
            broker.clone(),
            registry.clone(),
            results.clone(),
            options.visibility_timeout,
        ));

        let monitor = Arc::new(
            Monitor::new(broker.clone(), lanes, results.clone())
                .with_pool(pool.clone())
                .with_scheduler(scheduler.clone())
                .with_pipeline(pipeline.clone()),
        );

        let state = AppState::new(
            producer.clone(),
            scheduler.clone(),
            pipeline.clone(),
            monitor,
        )
        .with_monitor_ttl(Duration::ZERO);
        let router = router(state);

        Self {
            broker,
            leases,
            results,
            registry,
            producer,
            schedules,
            scheduler,
            pool,
            pipeline,
            store,
            router,
            cancel: CancellationToken::new(),
            options,
            _spill_dir: spill_dir,
        }
    }

    pub fn server(&self) -> TestServer {
        TestServer::new(self.router.clone()).expect("Failed to create test server")
    }

    /// Start dispatching. Stops when the context is dropped.
    pub fn start_pool(&self) -> JoinHandle<()> {
        self.pool.clone().start(self.cancel.child_token())
    }

    /// Start the pipeline's flush loop.
    pub fn start_flush_task(&self) -> JoinHandle<()> {
        self.pipeline.clone().start_flush_task(self.cancel.child_token())
    }

    /// A second scheduler instance sharing this context's register, leases,
    /// and producer.
    pub fn peer_scheduler(&self, instance_id: &str) -> Arc<Scheduler> {
        Arc::new(
            Scheduler::new(
                scheduler_config(instance_id),
                self.schedules.clone(),
                self.leases.clone(),
                self.producer.clone(),
            )
            .with_registry(self.registry.clone()),
        )
    }

    /// Poll the result store until the task reaches a terminal status.
    pub async fn wait_for_terminal(&self, id: TaskId, timeout: Duration) -> TaskResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.results.get(id).await {
                if result.status.is_terminal() {
                    return result;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {} did not finish within {:?}",
                id,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `check` holds or `timeout` passes.
    pub async fn eventually(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn scheduler_config(instance_id: &str) -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        tick_interval_ms: 50,
        lease_ttl_ms: 15_000,
        lease_key: "scheduler".to_string(),
        instance_id: instance_id.to_string(),
        catch_up_cap: 10,
        store_path: None,
    }
}
