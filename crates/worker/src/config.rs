//! Worker pool, scheduler, and result store configuration.

use engine_core::limits::{DEFAULT_CATCH_UP_CAP, DEFAULT_CONCURRENCY};
use engine_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum tasks in flight in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Lanes pulled in strict priority order, highest first.
    #[serde(default = "default_lanes")]
    pub lanes: Vec<String>,
    /// Per-attempt handler deadline.
    #[serde(default = "default_task_deadline_ms")]
    pub task_deadline_ms: u64,
    /// Backoff between task attempts. `max_retries` caps the retries any
    /// message gets here, whatever it was enqueued with.
    #[serde(default = "default_task_retry")]
    pub retry: RetryPolicy,
    /// Sleep when every lane is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Route exhausted tasks to the dead-letter queue; ack-remove otherwise.
    #[serde(default = "default_true")]
    pub dead_letter: bool,
    /// How long shutdown waits for in-flight tasks.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_lanes() -> Vec<String> {
    broker::BrokerConfig::default().lanes
}

fn default_task_deadline_ms() -> u64 {
    300_000
}

fn default_task_retry() -> RetryPolicy {
    RetryPolicy::new(
        engine_core::limits::DEFAULT_RETRIES,
        Duration::from_secs(1),
        Duration::from_secs(300),
    )
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lanes: default_lanes(),
            task_deadline_ms: default_task_deadline_ms(),
            retry: default_task_retry(),
            poll_interval_ms: default_poll_interval_ms(),
            dead_letter: default_true(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.task_deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Lease TTL; must exceed the tick interval so a live leader renews in time.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_lease_key")]
    pub lease_key: String,
    /// Defaults to a random id per process.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    /// Occurrences fired per entry per tick when catching up.
    #[serde(default = "default_catch_up_cap")]
    pub catch_up_cap: usize,
    /// JSON file backing the schedule register. In memory only when unset.
    #[serde(default)]
    pub store_path: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    15_000
}

fn default_lease_key() -> String {
    "scheduler".to_string()
}

fn default_instance_id() -> String {
    format!("scheduler-{}", uuid::Uuid::new_v4().simple())
}

fn default_catch_up_cap() -> usize {
    DEFAULT_CATCH_UP_CAP
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            lease_key: default_lease_key(),
            instance_id: default_instance_id(),
            catch_up_cap: default_catch_up_cap(),
            store_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

/// Result store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultStoreConfig {
    /// How long a result stays readable after its last update.
    #[serde(default = "default_result_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Results kept for the monitor's recent list.
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

fn default_max_entries() -> u64 {
    100_000
}

fn default_recent_capacity() -> usize {
    100
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ResultStoreConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_result_ttl_secs(),
            max_entries: default_max_entries(),
            recent_capacity: default_recent_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ResultStoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
