//! Ingestion pipeline and tick-feed configuration.

use engine_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What happens to a batch whose flush retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Write the batch to the spill directory for later replay.
    Spill,
    /// Discard the batch.
    Drop,
}

/// Batching pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per batch
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Maximum age of the oldest buffered record before a flush
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Occupancy at which submissions are refused
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    /// Hard timeout per flush attempt
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Backoff between flush attempts
    #[serde(default = "default_flush_retry")]
    pub flush_retry: RetryPolicy,
    #[serde(default = "default_on_failure")]
    pub on_failure: FailurePolicy,
    /// Directory for spilled batches
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
}

fn default_max_size() -> usize {
    1000
}

fn default_max_wait_ms() -> u64 {
    2000
}

fn default_high_water() -> usize {
    200_000
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_flush_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(10))
}

fn default_on_failure() -> FailurePolicy {
    FailurePolicy::Spill
}

fn default_spill_dir() -> PathBuf {
    PathBuf::from("./data/spill")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_wait_ms: default_max_wait_ms(),
            high_water: default_high_water(),
            flush_timeout_ms: default_flush_timeout_ms(),
            flush_retry: default_flush_retry(),
            on_failure: default_on_failure(),
            spill_dir: default_spill_dir(),
        }
    }
}

impl PipelineConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Redpanda tick-feed consumer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Broker addresses
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub partition: i32,
    /// Max records per fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max time a fetch waits for data
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Start from the earliest retained offset instead of the latest
    #[serde(default)]
    pub from_beginning: bool,
    /// SASL username (enables TLS + SCRAM-SHA-256)
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_topic() -> String {
    "ticks".to_string()
}

fn default_batch_size() -> usize {
    5000
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: default_brokers(),
            topic: default_topic(),
            partition: 0,
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            from_beginning: false,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

impl FeedConfig {
    /// Returns the broker list as a comma-separated string.
    pub fn broker_string(&self) -> String {
        self.brokers.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.max_wait(), Duration::from_secs(2));
        assert_eq!(config.on_failure, FailurePolicy::Spill);

        let feed = FeedConfig::default();
        assert!(!feed.enabled);
        assert_eq!(feed.broker_string(), "localhost:9092");
    }

    #[test]
    fn test_partial_deserialize() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_size": 50, "on_failure": "drop"}"#).unwrap();
        assert_eq!(config.max_size, 50);
        assert_eq!(config.on_failure, FailurePolicy::Drop);
        assert_eq!(config.high_water, 200_000);
    }
}
