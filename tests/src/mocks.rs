//! Mock implementations for testing.

use async_trait::async_trait;
use clickhouse_client::ColumnarStore;
use engine_core::{Record, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use telemetry::MetricsSnapshot;

/// Mock columnar store that captures batches in memory.
///
/// Implements the same `ColumnarStore` trait as the ClickHouse client, so
/// the pipeline runs its real flush, retry, and spill paths against it.
#[derive(Clone)]
pub struct MockStore {
    batches: Arc<Mutex<Vec<Vec<Record>>>>,
    snapshots: Arc<Mutex<Vec<MetricsSnapshot>>>,
    /// Simulate an unreachable store if set.
    should_fail: Arc<Mutex<bool>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
            snapshots: Arc::new(Mutex::new(Vec::new())),
            should_fail: Arc::new(Mutex::new(false)),
        }
    }

    /// All records written, in batch order.
    pub fn captured_records(&self) -> Vec<Record> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.lock() = fail;
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ColumnarStore for MockStore {
    async fn write_batch(&self, records: &[Record]) -> Result<usize> {
        if *self.should_fail.lock() {
            return Err(engine_core::Error::store_write("Mock store failure"));
        }
        self.batches.lock().push(records.to_vec());
        Ok(records.len())
    }

    async fn write_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        if *self.should_fail.lock() {
            return Err(engine_core::Error::store_write("Mock store failure"));
        }
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if *self.should_fail.lock() {
            return Err(engine_core::Error::store_write("Mock store unreachable"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_mock_store_captures_batches() {
        let store = MockStore::new();
        let batch = vec![Record::new(Utc::now(), "ticks").field("price", 1.5)];

        assert_eq!(store.write_batch(&batch).await.unwrap(), 1);
        assert_eq!(store.batch_count(), 1);
        assert_eq!(store.captured_records()[0].measurement, "ticks");
    }

    #[tokio::test]
    async fn test_mock_store_failure_mode() {
        let store = MockStore::new();
        store.set_should_fail(true);

        let batch = vec![Record::new(Utc::now(), "ticks").field("price", 1.5)];
        assert!(store.write_batch(&batch).await.is_err());
        assert!(store.ping().await.is_err());
        assert_eq!(store.record_count(), 0);
    }
}
