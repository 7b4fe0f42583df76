//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Lanes in strict priority order, highest first.
    #[serde(default = "default_lanes")]
    pub lanes: Vec<String>,
    /// How long a dequeued message stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    /// Dead letters kept before the oldest are evicted (logged and counted).
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
}

fn default_lanes() -> Vec<String> {
    vec![
        "critical".to_string(),
        engine_core::limits::DEFAULT_QUEUE.to_string(),
        "low".to_string(),
    ]
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

fn default_dead_letter_capacity() -> usize {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            dead_letter_capacity: default_dead_letter_capacity(),
        }
    }
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}
