//! Internal metrics collection.
//!
//! Process-wide counters read by the monitor snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s, 60s
    buckets: [AtomicU64; 12],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 12] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000, 60000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum() as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Collected metrics for the jobs engine.
#[derive(Debug, Default)]
pub struct Metrics {
    // Task lifecycle
    pub tasks_enqueued: Counter,
    pub tasks_started: Counter,
    pub tasks_succeeded: Counter,
    pub tasks_retried: Counter,
    pub tasks_failed: Counter,
    pub tasks_dead_lettered: Counter,
    pub dead_letters_evicted: Counter,
    pub stale_deliveries: Counter,
    pub handler_panics: Counter,
    pub deadlines_exceeded: Counter,
    pub broker_errors: Counter,

    // Scheduler
    pub schedules_fired: Counter,
    pub schedule_enqueue_failures: Counter,
    pub lease_contention: Counter,

    // Ingestion
    pub records_submitted: Counter,
    pub records_rejected: Counter,
    pub records_backpressured: Counter,
    pub records_flushed: Counter,
    pub batches_flushed: Counter,
    pub flush_errors: Counter,
    pub batches_spilled: Counter,
    pub records_spilled: Counter,
    pub records_dropped: Counter,

    // Tick feed
    pub feed_records_consumed: Counter,
    pub feed_errors: Counter,

    // Latency histograms
    pub task_latency_ms: Histogram,
    pub enqueue_latency_ms: Histogram,
    pub flush_latency_ms: Histogram,

    // Gauges
    pub active_workers: Gauge,
    pub ingest_occupancy: Gauge,
    pub backpressure_active: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tasks_enqueued: u64,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub dead_letters_evicted: u64,
    pub stale_deliveries: u64,
    pub handler_panics: u64,
    pub deadlines_exceeded: u64,
    pub broker_errors: u64,
    pub schedules_fired: u64,
    pub schedule_enqueue_failures: u64,
    pub lease_contention: u64,
    pub records_submitted: u64,
    pub records_rejected: u64,
    pub records_backpressured: u64,
    pub records_flushed: u64,
    pub batches_flushed: u64,
    pub flush_errors: u64,
    pub batches_spilled: u64,
    pub records_dropped: u64,
    pub feed_records_consumed: u64,
    pub task_latency_mean_ms: f64,
    pub flush_latency_mean_ms: f64,
    pub active_workers: u64,
    pub ingest_occupancy: u64,
    pub backpressure_active: bool,
}

impl Metrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            tasks_enqueued: self.tasks_enqueued.get(),
            tasks_started: self.tasks_started.get(),
            tasks_succeeded: self.tasks_succeeded.get(),
            tasks_retried: self.tasks_retried.get(),
            tasks_failed: self.tasks_failed.get(),
            tasks_dead_lettered: self.tasks_dead_lettered.get(),
            dead_letters_evicted: self.dead_letters_evicted.get(),
            stale_deliveries: self.stale_deliveries.get(),
            handler_panics: self.handler_panics.get(),
            deadlines_exceeded: self.deadlines_exceeded.get(),
            broker_errors: self.broker_errors.get(),
            schedules_fired: self.schedules_fired.get(),
            schedule_enqueue_failures: self.schedule_enqueue_failures.get(),
            lease_contention: self.lease_contention.get(),
            records_submitted: self.records_submitted.get(),
            records_rejected: self.records_rejected.get(),
            records_backpressured: self.records_backpressured.get(),
            records_flushed: self.records_flushed.get(),
            batches_flushed: self.batches_flushed.get(),
            flush_errors: self.flush_errors.get(),
            batches_spilled: self.batches_spilled.get(),
            records_dropped: self.records_dropped.get(),
            feed_records_consumed: self.feed_records_consumed.get(),
            task_latency_mean_ms: self.task_latency_ms.mean(),
            flush_latency_mean_ms: self.flush_latency_ms.mean(),
            active_workers: self.active_workers.get(),
            ingest_occupancy: self.ingest_occupancy.get(),
            backpressure_active: self.backpressure_active.get() > 0,
        }
    }
}

/// Global metrics registry.
pub static METRICS: std::sync::LazyLock<Metrics> = std::sync::LazyLock::new(Metrics::new);

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    &METRICS
}
