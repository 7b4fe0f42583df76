//! ClickHouse health checks.

use crate::client::ClickHouseClient;
use crate::schema::all_tables;
use crate::store::ColumnarStore;
use engine_core::Result;
use telemetry::health;
use tracing::{debug, error, info};

/// Check store reachability and record it in the health registry.
pub async fn check_connection(store: &dyn ColumnarStore) -> bool {
    match store.ping().await {
        Ok(()) => {
            debug!("Store connection healthy");
            health().store.set_healthy();
            true
        }
        Err(e) => {
            error!(error = %e, "Store health check failed");
            health().store.set_unhealthy(e.to_string());
            false
        }
    }
}

/// Initialize database schema.
pub async fn init_schema(client: &ClickHouseClient) -> Result<()> {
    for ddl in all_tables(client.database()) {
        client
            .query(&ddl)
            .execute()
            .await
            .map_err(|e| engine_core::Error::store_write(format!("Failed to execute DDL: {}", e)))?;
    }

    info!(database = %client.database(), "ClickHouse schema initialized");
    Ok(())
}
