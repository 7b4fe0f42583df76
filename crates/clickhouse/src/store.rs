//! Columnar store abstraction used by the ingestion pipeline.

use crate::client::ClickHouseClient;
use crate::insert::{insert_metrics, insert_records};
use async_trait::async_trait;
use engine_core::{Record, Result};
use telemetry::MetricsSnapshot;

/// Append-only sink for record batches.
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    /// Write one batch atomically. Returns the number of rows written.
    async fn write_batch(&self, records: &[Record]) -> Result<usize>;

    /// Persist a metrics snapshot.
    async fn write_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()>;

    /// Reachability check.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl ColumnarStore for ClickHouseClient {
    async fn write_batch(&self, records: &[Record]) -> Result<usize> {
        insert_records(self, records).await
    }

    async fn write_metrics(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        insert_metrics(self, snapshot).await
    }

    async fn ping(&self) -> Result<()> {
        self.query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map(|_| ())
            .map_err(|e| engine_core::Error::store_write(format!("ping failed: {}", e)))
    }
}
