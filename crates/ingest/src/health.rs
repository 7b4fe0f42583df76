//! Tick-feed health checks.

use crate::config::FeedConfig;
use crate::feed::connect;
use tracing::{debug, error, warn};

/// Check that the feed cluster is reachable and the topic exists.
pub async fn check_feed(config: &FeedConfig) -> bool {
    let client = match connect(config).await {
        Ok(client) => client,
        Err(e) => {
            error!(brokers = %config.broker_string(), error = %e, "Tick feed unreachable");
            return false;
        }
    };

    match client.list_topics().await {
        Ok(topics) => {
            let found = topics.iter().any(|t| t.name == config.topic);
            if found {
                debug!(topics = topics.len(), topic = %config.topic, "Tick feed healthy");
            } else {
                warn!(topic = %config.topic, "Tick feed topic does not exist");
            }
            found
        }
        Err(e) => {
            error!("Failed to list tick feed topics: {}", e);
            false
        }
    }
}
