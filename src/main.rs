//! Jobs Engine
//!
//! Async task processing and time-series ingestion:
//! - Priority lanes with visibility timeouts, ack/nack, and dead-lettering
//! - Bounded worker pool with retry, backoff, and per-task deadlines
//! - Leased periodic scheduler with catch-up
//! - Batched ingestion into ClickHouse with backpressure and local spill
//! - HTTP API for tasks, schedules, ingestion, monitoring, and health

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use api::{router, AppState};
use broker::{Broker, BrokerConfig, LeaseStore, MemoryBroker, MemoryLeaseStore};
use clickhouse_client::{ClickHouseClient, ClickHouseConfig, ColumnarStore};
use ingest::{FeedConfig, IngestionPipeline, PipelineConfig, TickFeed};
use telemetry::{health, init_tracing_from_env};
use worker::{
    register_builtin, HandlerRegistry, MemoryScheduleStore, Monitor, PoolConfig,
    ResultStore, ResultStoreConfig, ScheduleStore, Scheduler, SchedulerConfig, TaskProducer,
    WorkerPool,
};

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    /// Seconds between broker and store reachability probes
    #[serde(default = "default_health_check_interval_secs")]
    health_check_interval_secs: u64,

    #[serde(default)]
    broker: BrokerConfig,

    #[serde(default)]
    pool: PoolConfig,

    #[serde(default)]
    scheduler: SchedulerConfig,

    #[serde(default)]
    results: ResultStoreConfig,

    #[serde(default)]
    pipeline: PipelineConfig,

    #[serde(default)]
    feed: FeedConfig,

    #[serde(default)]
    clickhouse: ClickHouseConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_check_interval_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_check_interval_secs: default_health_check_interval_secs(),
            broker: BrokerConfig::default(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            results: ResultStoreConfig::default(),
            pipeline: PipelineConfig::default(),
            feed: FeedConfig::default(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ requires an explicit crypto provider before any TLS use
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting Jobs Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;

    info!(
        lanes = ?config.broker.lanes,
        concurrency = config.pool.concurrency,
        scheduler_enabled = config.scheduler.enabled,
        feed_enabled = config.feed.enabled,
        "Loaded config"
    );

    // Columnar store
    let clickhouse = Arc::new(
        ClickHouseClient::new(config.clickhouse.clone())
            .context("Failed to create ClickHouse client")?,
    );
    if config.clickhouse.init_schema {
        if let Err(e) = clickhouse_client::health::init_schema(&clickhouse).await {
            // Batches spill until the store comes back
            error!("Failed to initialize ClickHouse schema: {}", e);
        }
    }
    let store: Arc<dyn ColumnarStore> = clickhouse.clone();

    // Broker and leases
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.broker.clone()));
    let leases: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());

    // Ingestion pipeline
    let pipeline = Arc::new(IngestionPipeline::new(config.pipeline.clone(), store.clone()));

    // Handlers are fixed before anything can dispatch
    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry, pipeline.clone(), store.clone())
        .context("Failed to register built-in tasks")?;
    let registry = Arc::new(registry);
    info!(task_types = ?registry.task_types(), "Handlers registered");

    let results = Arc::new(ResultStore::new(config.results.clone()));
    let producer = Arc::new(
        TaskProducer::new(broker.clone(), results.clone(), config.broker.lanes.clone())
            .with_registry(registry.clone()),
    );

    // Schedule register
    let schedule_store: Arc<dyn ScheduleStore> = match &config.scheduler.store_path {
        Some(path) => Arc::new(
            MemoryScheduleStore::open(path)
                .await
                .context("Failed to load schedule register")?,
        ),
        None => Arc::new(MemoryScheduleStore::new()),
    };
    let entries = schedule_store.list().await?;
    registry
        .ensure_registered(&entries)
        .context("Schedule register references unknown task types")?;

    let scheduler = Arc::new(
        Scheduler::new(
            config.scheduler.clone(),
            schedule_store,
            leases,
            producer.clone(),
        )
        .with_registry(registry.clone()),
    );

    let pool = Arc::new(WorkerPool::new(
        config.pool.clone(),
        broker.clone(),
        registry.clone(),
        results.clone(),
        config.broker.visibility_timeout(),
    ));

    let monitor = Arc::new(
        Monitor::new(broker.clone(), config.broker.lanes.clone(), results.clone())
            .with_pool(pool.clone())
            .with_scheduler(scheduler.clone())
            .with_pipeline(pipeline.clone()),
    );

    check_health(broker.as_ref(), store.as_ref()).await;

    // Background tasks. The pipeline gets its own token so it drains after
    // the producers of records have stopped.
    let workers_cancel = CancellationToken::new();
    let pipeline_cancel = CancellationToken::new();

    let mut worker_handles: Vec<JoinHandle<()>> = vec![
        pool.clone().start(workers_cancel.child_token()),
        results.clone().start_sweeper(workers_cancel.child_token()),
        spawn_health_checks(
            broker.clone(),
            store.clone(),
            Duration::from_secs(config.health_check_interval_secs.max(1)),
            workers_cancel.child_token(),
        ),
    ];

    if config.scheduler.enabled {
        worker_handles.push(scheduler.clone().start(workers_cancel.child_token()));
    } else {
        health().scheduler.set_unhealthy("disabled");
        info!("Scheduler disabled");
    }

    if config.feed.enabled {
        if !ingest::check_feed(&config.feed).await {
            warn!(topic = %config.feed.topic, "Tick feed not reachable yet, consumer will retry");
        }
        let feed = Arc::new(TickFeed::new(config.feed.clone()));
        worker_handles.push(feed.start(pipeline.clone(), workers_cancel.child_token()));
    }

    let flush_handle = pipeline.clone().start_flush_task(pipeline_cancel.clone());

    match pipeline.spilled_batches().await {
        Ok(0) => {}
        Ok(n) => warn!(batches = n, "Spilled batches waiting for replay"),
        Err(e) => error!("Failed to inspect spill directory: {}", e),
    }

    let state = AppState::new(producer, scheduler, pipeline.clone(), monitor);
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;

    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down...");

    workers_cancel.cancel();
    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!("Background task failed during shutdown: {}", e);
        }
    }

    pipeline_cancel.cancel();
    if let Err(e) = flush_handle.await {
        error!("Flush task failed during shutdown: {}", e);
    }

    let remaining = pipeline.stats().occupancy;
    if remaining > 0 {
        warn!(records = remaining, "Records still buffered at exit");
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from defaults, `config/default.toml`, and `JOBS__*`
/// environment variables (`JOBS__POOL__CONCURRENCY=50`).
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::with_prefix("JOBS")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broker.lanes")
                .with_list_parse_key("pool.lanes")
                .with_list_parse_key("feed.brokers")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Check component health on startup.
async fn check_health(broker: &dyn Broker, store: &dyn ColumnarStore) {
    if broker::health::check_connection(broker).await {
        info!("Broker connection: healthy");
    } else {
        error!("Broker connection: unhealthy");
    }

    if clickhouse_client::health::check_connection(store).await {
        info!("ClickHouse connection: healthy");
    } else {
        error!("ClickHouse connection: unhealthy");
    }
}

/// Probe the broker and store on a fixed interval.
fn spawn_health_checks(
    broker: Arc<dyn Broker>,
    store: Arc<dyn ColumnarStore>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately and startup already probed
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    broker::health::check_connection(broker.as_ref()).await;
                    clickhouse_client::health::check_connection(store.as_ref()).await;
                }
            }
        }
    })
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
