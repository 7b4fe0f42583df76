//! Batched ingestion into the columnar store.
//!
//! Submitters append to a bounded buffer; a single flush loop drains it
//! in arrival order, one batch at a time. A batch that cannot be written
//! after its retries is spilled or dropped per [`FailurePolicy`].

use crate::buffer::RecordBuffer;
use crate::config::{FailurePolicy, PipelineConfig};
use crate::spill::SpillDir;
use chrono::{DateTime, Utc};
use clickhouse_client::ColumnarStore;
use engine_core::{Error, FieldValue, Record, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry::{health, metrics, Counter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What became of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Written(usize),
    Spilled { records: usize, path: PathBuf },
    Dropped(usize),
}

/// Point-in-time pipeline statistics for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub buffered: usize,
    pub in_flush: usize,
    pub occupancy: usize,
    pub high_water: usize,
    pub backpressure: bool,
    pub records_accepted: u64,
    pub records_rejected: u64,
    pub records_flushed: u64,
    pub batches_flushed: u64,
    pub flush_failures: u64,
    pub batches_spilled: u64,
    pub records_dropped: u64,
    pub records_replayed: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    accepted: Counter,
    rejected: Counter,
    flushed: Counter,
    batches: Counter,
    failures: Counter,
    spilled: Counter,
    dropped: Counter,
    replayed: Counter,
    last_flush_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

/// The ingestion pipeline.
pub struct IngestionPipeline {
    config: PipelineConfig,
    buffer: RecordBuffer,
    store: Arc<dyn ColumnarStore>,
    spill: SpillDir,
    counters: Counters,
    /// Serializes flush cycles so each batch has exactly one owner.
    flush_lock: tokio::sync::Mutex<()>,
}

impl IngestionPipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn ColumnarStore>) -> Self {
        let buffer = RecordBuffer::new(config.max_size, config.high_water);
        let spill = SpillDir::new(config.spill_dir.clone());
        Self {
            config,
            buffer,
            store,
            spill,
            counters: Counters::default(),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Accept one record, or refuse with `Backpressure` at the high-water
    /// mark. Never waits.
    pub fn submit(&self, record: Record) -> Result<usize> {
        self.submit_many(vec![record])
    }

    /// Build and submit a record from its parts.
    pub fn submit_point(
        &self,
        timestamp: DateTime<Utc>,
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
    ) -> Result<usize> {
        self.submit(Record {
            timestamp,
            measurement: measurement.into(),
            tags,
            fields,
        })
    }

    /// Accept all records or none. Returns occupancy after the append.
    pub fn submit_many(&self, records: Vec<Record>) -> Result<usize> {
        let count = records.len() as u64;
        if let Err(e) = records.iter().try_for_each(Record::check) {
            self.counters.rejected.inc_by(count);
            metrics().records_rejected.inc_by(count);
            return Err(e);
        }

        match self.buffer.push_all(records) {
            Ok(occupancy) => {
                self.counters.accepted.inc_by(count);
                metrics().records_submitted.inc_by(count);
                metrics().ingest_occupancy.set(occupancy as u64);
                Ok(occupancy)
            }
            Err(e) => {
                if matches!(e, Error::Backpressure { .. }) {
                    metrics().records_backpressured.inc_by(count);
                    metrics().backpressure_active.set(1);
                    debug!(records = count, "Ingestion backpressure");
                }
                Err(e)
            }
        }
    }

    /// Spawn the flush loop. On cancellation the buffer is drained before
    /// the task exits.
    pub fn start_flush_task(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                max_size = self.config.max_size,
                max_wait_ms = self.config.max_wait_ms,
                high_water = self.config.high_water,
                "Ingestion flush loop started"
            );

            loop {
                match self.buffer.time_until_due(self.config.max_wait()) {
                    Some(wait) if wait.is_zero() => {}
                    Some(wait) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.buffer.changed() => continue,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.buffer.changed() => continue,
                        }
                    }
                }

                self.flush_once().await;
            }

            let written = self.flush().await;
            info!(records = written, "Ingestion flush loop stopped");
        })
    }

    /// Flush everything currently buffered. Returns records written.
    pub async fn flush(&self) -> usize {
        let mut written = 0;
        while let Some(outcome) = self.flush_once().await {
            if let FlushOutcome::Written(n) = outcome {
                written += n;
            }
        }
        written
    }

    async fn flush_once(&self) -> Option<FlushOutcome> {
        let _cycle = self.flush_lock.lock().await;

        let batch = self.buffer.take_batch();
        if batch.is_empty() {
            return None;
        }

        let outcome = self.flush_batch(batch).await;
        self.buffer.finish_flush();

        let occupancy = self.buffer.occupancy();
        metrics().ingest_occupancy.set(occupancy as u64);
        if occupancy < self.buffer.high_water() {
            metrics().backpressure_active.set(0);
        }
        Some(outcome)
    }

    async fn flush_batch(&self, batch: Vec<Record>) -> FlushOutcome {
        let count = batch.len();
        let err = match self.write_with_retry(&batch).await {
            Ok(n) => return FlushOutcome::Written(n),
            Err(e) => e,
        };

        *self.counters.last_error.lock() = Some(err.to_string());
        health().store.set_unhealthy(err.to_string());

        match self.config.on_failure {
            FailurePolicy::Spill => match self.spill.write(&batch).await {
                Ok(path) => {
                    self.counters.spilled.inc();
                    metrics().batches_spilled.inc();
                    metrics().records_spilled.inc_by(count as u64);
                    error!(records = count, path = %path.display(), error = %err, "Flush failed, batch spilled");
                    FlushOutcome::Spilled {
                        records: count,
                        path,
                    }
                }
                Err(spill_err) => {
                    self.record_drop(count);
                    error!(records = count, error = %err, spill_error = %spill_err, "Flush and spill failed, batch dropped");
                    FlushOutcome::Dropped(count)
                }
            },
            FailurePolicy::Drop => {
                self.record_drop(count);
                error!(records = count, error = %err, "Flush failed, batch dropped");
                FlushOutcome::Dropped(count)
            }
        }
    }

    fn record_drop(&self, count: usize) {
        self.counters.dropped.inc_by(count as u64);
        metrics().records_dropped.inc_by(count as u64);
    }

    /// Write one batch, retrying with backoff. Each attempt has a hard
    /// timeout.
    async fn write_with_retry(&self, batch: &[Record]) -> Result<usize> {
        let policy = self.config.flush_retry;
        let mut attempt = 0;

        loop {
            let start = tokio::time::Instant::now();
            let result =
                match tokio::time::timeout(self.config.flush_timeout(), self.store.write_batch(batch))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::store_write(format!(
                        "flush timed out after {}ms",
                        self.config.flush_timeout_ms
                    ))),
                };

            match result {
                Ok(written) => {
                    let elapsed = start.elapsed();
                    self.counters.flushed.inc_by(written as u64);
                    self.counters.batches.inc();
                    *self.counters.last_flush_at.lock() = Some(Utc::now());
                    metrics().records_flushed.inc_by(written as u64);
                    metrics().batches_flushed.inc();
                    metrics().flush_latency_ms.observe(elapsed.as_millis() as u64);
                    health().store.set_healthy();
                    debug!(records = written, latency_ms = %elapsed.as_millis(), "Flushed batch");
                    return Ok(written);
                }
                Err(e) => {
                    self.counters.failures.inc();
                    metrics().flush_errors.inc();
                    if attempt >= policy.max_retries {
                        return Err(e);
                    }
                    let backoff = policy.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        records = batch.len(),
                        backoff_ms = %backoff.as_millis(),
                        error = %e,
                        "Flush attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Re-flush spilled batches, oldest first. Stops at the first batch the
    /// store still refuses. Returns records replayed.
    pub async fn replay_spilled(&self) -> Result<usize> {
        let _cycle = self.flush_lock.lock().await;

        let mut replayed = 0;
        for path in self.spill.list().await? {
            let records = self.spill.read(&path).await?;
            if !records.is_empty() {
                self.write_with_retry(&records).await?;
            }
            self.spill.remove(&path).await?;
            replayed += records.len();
            info!(path = %path.display(), records = records.len(), "Replayed spilled batch");
        }

        self.counters.replayed.inc_by(replayed as u64);
        Ok(replayed)
    }

    /// Spilled batches waiting for replay.
    pub async fn spilled_batches(&self) -> Result<usize> {
        Ok(self.spill.list().await?.len())
    }

    pub fn stats(&self) -> PipelineStats {
        let in_flush = self.buffer.in_flush();
        let buffered = self.buffer.len();
        let occupancy = buffered + in_flush;
        PipelineStats {
            buffered,
            in_flush,
            occupancy,
            high_water: self.buffer.high_water(),
            backpressure: occupancy >= self.buffer.high_water(),
            records_accepted: self.counters.accepted.get(),
            records_rejected: self.counters.rejected.get(),
            records_flushed: self.counters.flushed.get(),
            batches_flushed: self.counters.batches.get(),
            flush_failures: self.counters.failures.get(),
            batches_spilled: self.counters.spilled.get(),
            records_dropped: self.counters.dropped.get(),
            records_replayed: self.counters.replayed.get(),
            last_flush_at: *self.counters.last_flush_at.lock(),
            last_error: self.counters.last_error.lock().clone(),
        }
    }
}
