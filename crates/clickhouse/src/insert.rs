//! Batch insert helpers for ClickHouse.

use crate::client::ClickHouseClient;
use clickhouse::Row;
use engine_core::{FieldValue, Record, Result};
use serde::Serialize;
use telemetry::MetricsSnapshot;
use tracing::debug;

/// Flattened record row for the `measurements` table.
#[derive(Debug, Clone, PartialEq, Row, Serialize)]
pub struct RecordRow {
    /// Nanoseconds since epoch.
    pub timestamp: i64,
    pub measurement: String,
    pub tag_keys: Vec<String>,
    pub tag_values: Vec<String>,
    pub field_keys: Vec<String>,
    pub field_values: Vec<f64>,
    pub string_fields: String,
}

impl From<&Record> for RecordRow {
    fn from(record: &Record) -> Self {
        let (tag_keys, tag_values) = record
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .unzip();

        let mut field_keys = Vec::with_capacity(record.fields.len());
        let mut field_values = Vec::with_capacity(record.fields.len());
        let mut strings = serde_json::Map::new();
        for (key, value) in &record.fields {
            match value.as_f64() {
                Some(v) => {
                    field_keys.push(key.clone());
                    field_values.push(v);
                }
                None => {
                    if let FieldValue::Str(s) = value {
                        strings.insert(key.clone(), serde_json::Value::String(s.clone()));
                    }
                }
            }
        }

        let string_fields = if strings.is_empty() {
            String::new()
        } else {
            serde_json::Value::Object(strings).to_string()
        };

        Self {
            timestamp: record
                .timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| record.timestamp.timestamp_micros().saturating_mul(1_000)),
            measurement: record.measurement.clone(),
            tag_keys,
            tag_values,
            field_keys,
            field_values,
            string_fields,
        }
    }
}

/// Insert a batch of records in a single INSERT statement.
pub async fn insert_records(client: &ClickHouseClient, records: &[Record]) -> Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let start = std::time::Instant::now();

    let mut insert = client.insert::<RecordRow>("measurements")?;

    for record in records {
        insert
            .write(&RecordRow::from(record))
            .await
            .map_err(|e| engine_core::Error::store_write(format!("Write error: {}", e)))?;
    }

    insert
        .end()
        .await
        .map_err(|e| engine_core::Error::store_write(format!("End error: {}", e)))?;

    debug!(
        count = records.len(),
        latency_ms = %start.elapsed().as_millis(),
        "Inserted records to ClickHouse"
    );

    Ok(records.len())
}

/// Metrics snapshot row for the `internal_metrics` table.
#[derive(Debug, Clone, Row, Serialize)]
pub struct MetricsRow {
    pub timestamp: i64,
    pub tasks_enqueued: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub handler_panics: u64,
    pub schedules_fired: u64,
    pub records_submitted: u64,
    pub records_flushed: u64,
    pub records_backpressured: u64,
    pub batches_flushed: u64,
    pub flush_errors: u64,
    pub batches_spilled: u64,
    pub records_dropped: u64,
    pub task_latency_mean_ms: f64,
    pub flush_latency_mean_ms: f64,
    pub active_workers: u64,
    pub ingest_occupancy: u64,
    pub backpressure_active: u8,
}

impl From<&MetricsSnapshot> for MetricsRow {
    fn from(s: &MetricsSnapshot) -> Self {
        Self {
            timestamp: s.timestamp.timestamp_millis(),
            tasks_enqueued: s.tasks_enqueued,
            tasks_succeeded: s.tasks_succeeded,
            tasks_retried: s.tasks_retried,
            tasks_failed: s.tasks_failed,
            tasks_dead_lettered: s.tasks_dead_lettered,
            handler_panics: s.handler_panics,
            schedules_fired: s.schedules_fired,
            records_submitted: s.records_submitted,
            records_flushed: s.records_flushed,
            records_backpressured: s.records_backpressured,
            batches_flushed: s.batches_flushed,
            flush_errors: s.flush_errors,
            batches_spilled: s.batches_spilled,
            records_dropped: s.records_dropped,
            task_latency_mean_ms: s.task_latency_mean_ms,
            flush_latency_mean_ms: s.flush_latency_mean_ms,
            active_workers: s.active_workers,
            ingest_occupancy: s.ingest_occupancy,
            backpressure_active: u8::from(s.backpressure_active),
        }
    }
}

/// Insert a single metrics snapshot.
pub async fn insert_metrics(client: &ClickHouseClient, snapshot: &MetricsSnapshot) -> Result<()> {
    let mut insert = client.insert::<MetricsRow>("internal_metrics")?;

    insert
        .write(&MetricsRow::from(snapshot))
        .await
        .map_err(|e| engine_core::Error::store_write(format!("Write error: {}", e)))?;

    insert
        .end()
        .await
        .map_err(|e| engine_core::Error::store_write(format!("End error: {}", e)))?;

    Ok(())
}
