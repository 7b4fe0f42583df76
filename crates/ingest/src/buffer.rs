//! Bounded record buffer.
//!
//! Occupancy counts buffered records plus the batch currently being
//! flushed, so a slow store keeps pushing back on submitters until the
//! in-flight batch is written or spilled.

use engine_core::{Error, Record, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Inner {
    /// Records with their arrival time, oldest first.
    records: VecDeque<(Instant, Record)>,
    /// Size of the batch handed to the flush loop and not yet finished.
    in_flush: usize,
}

/// FIFO record buffer with a high-water mark.
pub struct RecordBuffer {
    max_size: usize,
    high_water: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl RecordBuffer {
    pub fn new(max_size: usize, high_water: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            high_water: high_water.max(1),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Append one record. Returns the occupancy after the append.
    pub fn push(&self, record: Record) -> Result<usize> {
        self.push_all(vec![record])
    }

    /// Append all records or none of them.
    pub fn push_all(&self, records: Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            return Ok(self.occupancy());
        }
        if records.len() > self.high_water {
            return Err(Error::validation(format!(
                "{} records exceed the buffer capacity of {}",
                records.len(),
                self.high_water
            )));
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        let occupancy = inner.records.len() + inner.in_flush;
        if occupancy + records.len() > self.high_water {
            return Err(Error::Backpressure {
                occupancy,
                high_water: self.high_water,
            });
        }

        let was_empty = inner.records.is_empty();
        inner.records.extend(records.into_iter().map(|r| (now, r)));
        let len = inner.records.len();
        let occupancy = len + inner.in_flush;
        drop(inner);

        // Wake the flush loop when a deadline starts or a batch fills.
        if was_empty || len >= self.max_size {
            self.notify.notify_one();
        }
        Ok(occupancy)
    }

    /// Take up to `max_size` records, oldest first, and mark them in flush.
    pub fn take_batch(&self) -> Vec<Record> {
        let mut inner = self.inner.lock();
        let n = inner.records.len().min(self.max_size);
        let batch: Vec<Record> = inner.records.drain(..n).map(|(_, r)| r).collect();
        inner.in_flush = batch.len();
        batch
    }

    /// Release the in-flush reservation once a batch is written, spilled, or
    /// dropped.
    pub fn finish_flush(&self) {
        self.inner.lock().in_flush = 0;
    }

    /// Time until the next flush is due, `Some(ZERO)` when due now, `None`
    /// when empty.
    pub fn time_until_due(&self, max_wait: Duration) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.records.len() >= self.max_size {
            return Some(Duration::ZERO);
        }
        let (arrived, _) = inner.records.front()?;
        Some((*arrived + max_wait).saturating_duration_since(Instant::now()))
    }

    /// Wait for a push that may change the flush deadline.
    pub async fn changed(&self) {
        self.notify.notified().await
    }

    pub fn occupancy(&self) -> usize {
        let inner = self.inner.lock();
        inner.records.len() + inner.in_flush
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flush(&self) -> usize {
        self.inner.lock().in_flush
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}
