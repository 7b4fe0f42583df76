//! Broker health checks.

use crate::broker::Broker;
use telemetry::health;
use tracing::{debug, error};

/// Ping the broker and record the outcome in the health registry.
pub async fn check_connection(broker: &dyn Broker) -> bool {
    match broker.ping().await {
        Ok(()) => {
            debug!("Broker connection healthy");
            health().broker.set_healthy();
            true
        }
        Err(e) => {
            error!(error = %e, "Broker health check failed");
            health().broker.set_unhealthy(e.to_string());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;

    #[tokio::test]
    async fn test_check_connection() {
        let broker = MemoryBroker::default();
        assert!(check_connection(&broker).await);

        broker.set_available(false);
        assert!(!check_connection(&broker).await);
    }
}
