//! ClickHouse table schemas.
//!
//! Statements use a `{db}` placeholder for the configured database.
//! Tags and fields are stored as parallel key/value arrays so new tag or
//! field names never require a migration.

pub const CREATE_DATABASE: &str = r#"
CREATE DATABASE IF NOT EXISTS {db}
"#;

/// Time-series observations written by the ingestion pipeline.
pub const CREATE_MEASUREMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {db}.measurements (
    timestamp DateTime64(9),
    measurement LowCardinality(String),

    tag_keys Array(LowCardinality(String)),
    tag_values Array(String),

    -- Numeric fields (floats, ints, bools as 0/1)
    field_keys Array(LowCardinality(String)),
    field_values Array(Float64),

    -- Non-numeric fields as a JSON object
    string_fields String,

    inserted_at DateTime DEFAULT now()
)
ENGINE = MergeTree()
PARTITION BY toYYYYMM(timestamp)
ORDER BY (measurement, timestamp)
TTL toDateTime(timestamp) + INTERVAL 365 DAY
SETTINGS index_granularity = 8192
"#;

/// Periodic snapshots of the process metrics.
pub const CREATE_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS {db}.internal_metrics (
    timestamp DateTime64(3),
    tasks_enqueued UInt64,
    tasks_succeeded UInt64,
    tasks_retried UInt64,
    tasks_failed UInt64,
    tasks_dead_lettered UInt64,
    handler_panics UInt64,
    schedules_fired UInt64,
    records_submitted UInt64,
    records_flushed UInt64,
    records_backpressured UInt64,
    batches_flushed UInt64,
    flush_errors UInt64,
    batches_spilled UInt64,
    records_dropped UInt64,
    task_latency_mean_ms Float64,
    flush_latency_mean_ms Float64,
    active_workers UInt64,
    ingest_occupancy UInt64,
    backpressure_active UInt8
)
ENGINE = MergeTree()
PARTITION BY toYYYYMM(timestamp)
ORDER BY timestamp
TTL toDateTime(timestamp) + INTERVAL 30 DAY
SETTINGS index_granularity = 8192
"#;

/// All DDL for `database`, in execution order.
pub fn all_tables(database: &str) -> Vec<String> {
    [CREATE_DATABASE, CREATE_MEASUREMENTS_TABLE, CREATE_METRICS_TABLE]
        .iter()
        .map(|ddl| ddl.replace("{db}", database))
        .collect()
}
