//! Tasks every worker process registers.
//!
//! - `ingest_records`: hand a record batch to the ingestion pipeline
//! - `persist_metrics`: write the current metrics snapshot to the store
//! - `replay_spill`: re-flush batches spilled while the store was down
//!
//! The last two are meant to be driven by schedule entries.

use crate::handler::{HandlerRegistry, Task, TaskContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse_client::ColumnarStore;
use engine_core::{Record, Result};
use ingest::IngestionPipeline;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use telemetry::metrics;
use tracing::{debug, info};

/// Arguments for tasks that take none. Accepts `{}` or `null`.
#[derive(Debug, Default, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Deserialize)]
pub struct IngestArgs {
    pub records: Vec<Record>,
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub occupancy: usize,
}

/// Submits a batch to the pipeline. A full buffer fails with
/// `Backpressure`, which the pool retries with backoff.
pub struct IngestRecords {
    pipeline: Arc<IngestionPipeline>,
}

impl IngestRecords {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for IngestRecords {
    const NAME: &'static str = "ingest_records";
    type Args = IngestArgs;
    type Output = IngestOutcome;

    async fn run(&self, ctx: TaskContext, args: IngestArgs) -> Result<IngestOutcome> {
        ctx.checkpoint()?;
        let accepted = args.records.len();
        let occupancy = self.pipeline.submit_many(args.records)?;
        debug!(task_id = %ctx.task_id, accepted, occupancy, "Records handed to pipeline");
        Ok(IngestOutcome {
            accepted,
            occupancy,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsPersisted {
    pub written_at: DateTime<Utc>,
    pub tasks_succeeded: u64,
    pub records_flushed: u64,
}

pub struct PersistMetrics {
    store: Arc<dyn ColumnarStore>,
}

impl PersistMetrics {
    pub fn new(store: Arc<dyn ColumnarStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Task for PersistMetrics {
    const NAME: &'static str = "persist_metrics";
    type Args = Option<NoArgs>;
    type Output = MetricsPersisted;

    async fn run(&self, _ctx: TaskContext, _args: Option<NoArgs>) -> Result<MetricsPersisted> {
        let snapshot = metrics().snapshot();
        self.store.write_metrics(&snapshot).await?;
        Ok(MetricsPersisted {
            written_at: snapshot.timestamp,
            tasks_succeeded: snapshot.tasks_succeeded,
            records_flushed: snapshot.records_flushed,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SpillReplayed {
    pub records: usize,
    pub remaining_batches: usize,
}

pub struct ReplaySpill {
    pipeline: Arc<IngestionPipeline>,
}

impl ReplaySpill {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Task for ReplaySpill {
    const NAME: &'static str = "replay_spill";
    type Args = Option<NoArgs>;
    type Output = SpillReplayed;

    async fn run(&self, _ctx: TaskContext, _args: Option<NoArgs>) -> Result<SpillReplayed> {
        let records = self.pipeline.replay_spilled().await?;
        let remaining_batches = self.pipeline.spilled_batches().await?;
        if records > 0 {
            info!(records, remaining_batches, "Spilled batches replayed");
        }
        Ok(SpillReplayed {
            records,
            remaining_batches,
        })
    }
}

/// Register the built-in tasks.
pub fn register_builtin(
    registry: &mut HandlerRegistry,
    pipeline: Arc<IngestionPipeline>,
    store: Arc<dyn ColumnarStore>,
) -> Result<()> {
    registry.register(IngestRecords::new(pipeline.clone()))?;
    registry.register(PersistMetrics::new(store))?;
    registry.register(ReplaySpill::new(pipeline))?;
    Ok(())
}
