//! Defaults and size limits for the jobs engine.
//!
//! Ingestion limits are tuned for a 100k records/sec target:
//! 1000-record batches at that rate mean ~100 flushes/sec, and a
//! 200k high-water mark bounds buffered memory to roughly two seconds of
//! peak traffic.

// === Task defaults ===

/// Lane used when a producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Lane receiving tasks that exhausted their retries.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Retries granted to a task unless the producer overrides it.
pub const DEFAULT_RETRIES: u32 = 3;

pub const DEFAULT_PRIORITY: u8 = 0;

/// In-flight tasks per worker process.
pub const DEFAULT_CONCURRENCY: usize = 200;

// === Ingestion limits ===

/// Maximum ingest request body in bytes (4MB).
pub const MAX_INGEST_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Maximum single line-protocol line in bytes (64KB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Maximum measurement name length.
pub const MAX_MEASUREMENT_LEN: u64 = 128;

/// Maximum tags per record.
pub const MAX_TAGS: usize = 32;

/// Maximum fields per record.
pub const MAX_FIELDS: usize = 256;

// === Scheduler ===

/// Cap on missed occurrences fired for a catch-up entry.
pub const DEFAULT_CATCH_UP_CAP: usize = 10;
