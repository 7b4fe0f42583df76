//! Leased periodic scheduler.
//!
//! Each tick the instance tries to take (or renew) a lease. Only the holder
//! scans the register. For every due entry it re-checks the lease, advances
//! the entry with a compare-and-set on its revision, and then enqueues the
//! task. If the enqueue fails the advancement is rolled back so the entry
//! fires on the next tick.

use crate::config::SchedulerConfig;
use crate::handler::HandlerRegistry;
use crate::producer::TaskProducer;
use crate::schedule_store::ScheduleStore;
use broker::{Lease, LeaseStore};
use chrono::{DateTime, Utc};
use engine_core::limits::{DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RETRIES};
use engine_core::{Cadence, Error, Result, ScheduleEntry, TaskMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use telemetry::{health, metrics};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at a management update before giving up on a contended entry.
const UPDATE_ATTEMPTS: usize = 5;

/// New schedule entry as submitted by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub task_type: String,
    pub cadence: Cadence,
    #[serde(default)]
    pub payload_template: serde_json::Value,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<u8>,
}

fn default_true() -> bool {
    true
}

impl NewSchedule {
    pub fn into_entry(self, now: DateTime<Utc>) -> Result<ScheduleEntry> {
        let payload = if self.payload_template.is_null() {
            serde_json::json!({})
        } else {
            self.payload_template
        };
        let mut entry = ScheduleEntry::new(self.name, self.task_type, payload, self.cadence, now)?
            .with_queue(self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()))
            .with_catch_up(self.catch_up);
        entry.enabled = self.enabled;
        entry.retries = self.retries.unwrap_or(DEFAULT_RETRIES);
        entry.priority = self.priority.unwrap_or(DEFAULT_PRIORITY);
        entry.check()?;
        Ok(entry)
    }
}

/// Partial edit of an existing entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub cadence: Option<Cadence>,
    #[serde(default)]
    pub payload_template: Option<serde_json::Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub catch_up: Option<bool>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl ScheduleUpdate {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    /// Apply to `entry`.
    ///
    /// A cadence change or re-enable recomputes `next_run_at` from `now`, so
    /// an entry that sat disabled does not fire for the time it was off.
    pub fn apply(&self, entry: &mut ScheduleEntry, now: DateTime<Utc>) -> Result<()> {
        if let Some(task_type) = &self.task_type {
            entry.task_type = task_type.clone();
        }
        if let Some(payload) = &self.payload_template {
            entry.payload_template = payload.clone();
        }
        if let Some(queue) = &self.queue {
            entry.queue = queue.clone();
        }
        if let Some(catch_up) = self.catch_up {
            entry.catch_up = catch_up;
        }
        if let Some(retries) = self.retries {
            entry.retries = retries;
        }
        if let Some(priority) = self.priority {
            entry.priority = priority;
        }

        let mut reschedule = false;
        if let Some(cadence) = &self.cadence {
            if *cadence != entry.cadence {
                entry.cadence = cadence.clone();
                reschedule = true;
            }
        }
        if let Some(enabled) = self.enabled {
            reschedule |= enabled && !entry.enabled;
            entry.enabled = enabled;
        }
        if reschedule {
            entry.reschedule(now)?;
        }
        entry.check()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Whether this instance held the lease.
    pub leader: bool,
    /// Entry name per enqueued message.
    pub fired: Vec<String>,
    /// Missed occurrences not fired.
    pub skipped: usize,
    pub failures: usize,
    pub lease_lost: bool,
}

impl TickReport {
    pub fn enqueued(&self) -> usize {
        self.fired.len()
    }
}

/// Scheduler state for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub instance_id: String,
    pub leader: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub entries: usize,
    pub enabled_entries: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    leases: Arc<dyn LeaseStore>,
    producer: Arc<TaskProducer>,
    registry: Option<Arc<HandlerRegistry>>,
    lease: Mutex<Option<Lease>>,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        leases: Arc<dyn LeaseStore>,
        producer: Arc<TaskProducer>,
    ) -> Self {
        Self {
            config,
            store,
            leases,
            producer,
            registry: None,
            lease: Mutex::new(None),
            last_tick_at: Mutex::new(None),
        }
    }

    /// Reject entries whose task type has no handler.
    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Run one scheduling pass at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        *self.last_tick_at.lock() = Some(now);
        health().scheduler.set_healthy();

        let acquired = self
            .leases
            .try_acquire(
                &self.config.lease_key,
                &self.config.instance_id,
                self.config.lease_ttl(),
            )
            .await?;
        let Some(lease) = acquired else {
            *self.lease.lock() = None;
            metrics().lease_contention.inc();
            let holder = self
                .leases
                .holder(&self.config.lease_key)
                .await?
                .unwrap_or_default();
            let contention = Error::LockContention {
                key: self.config.lease_key.clone(),
                holder,
            };
            debug!(instance = %self.config.instance_id, error = %contention, "Scheduler idle");
            return Ok(report);
        };
        *self.lease.lock() = Some(lease.clone());
        report.leader = true;

        for entry in self.store.list().await? {
            let plan = match entry.plan_firings(now, self.config.catch_up_cap) {
                Ok(Some(plan)) => plan,
                Ok(None) => continue,
                Err(e) => {
                    error!(schedule = %entry.name, error = %e, "Cannot plan schedule entry");
                    report.failures += 1;
                    continue;
                }
            };

            if !self.leases.is_held(&lease).await? {
                warn!(instance = %self.config.instance_id, "Lease lost mid-tick, stopping");
                *self.lease.lock() = None;
                report.lease_lost = true;
                break;
            }

            let mut advanced = entry.clone();
            advanced.last_run_at = Some(plan.last_run_at);
            advanced.next_run_at = plan.next_run_at;
            let Some(advanced) = self
                .store
                .compare_and_set(&entry.name, entry.revision, advanced)
                .await?
            else {
                debug!(schedule = %entry.name, "Entry changed since it was read, skipping");
                continue;
            };

            if plan.skipped > 0 {
                info!(schedule = %entry.name, skipped = plan.skipped, "Missed occurrences skipped");
            }
            report.skipped += plan.skipped;

            for (i, occurrence) in plan.occurrences.iter().enumerate() {
                let message = TaskMessage::new(advanced.task_type.clone(), advanced.payload_template.clone())
                    .with_queue(advanced.queue.clone())
                    .with_retries(advanced.retries)
                    .with_priority(advanced.priority);

                match self.producer.enqueue_message(&message).await {
                    Ok(()) => {
                        metrics().schedules_fired.inc();
                        report.fired.push(entry.name.clone());
                        info!(
                            schedule = %entry.name,
                            task_id = %message.id,
                            occurrence = %occurrence,
                            next_run_at = %advanced.next_run_at,
                            "Schedule fired"
                        );
                    }
                    Err(e) => {
                        metrics().schedule_enqueue_failures.inc();
                        report.failures += 1;
                        error!(schedule = %entry.name, occurrence = %occurrence, error = %e, "Schedule enqueue failed, rolling back");

                        // Resume from the first occurrence that did not go out.
                        let last_run_at = match i {
                            0 => entry.last_run_at,
                            _ => Some(plan.occurrences[i - 1]),
                        };
                        self.rewind(&advanced, *occurrence, last_run_at).await;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Move an advanced entry back to `next_run_at` after a failed enqueue.
    ///
    /// Only the two run timestamps change, so operator edits made since the
    /// advance survive. If the entry was rescheduled in the meantime the new
    /// schedule wins and nothing is rewound.
    async fn rewind(
        &self,
        advanced: &ScheduleEntry,
        next_run_at: DateTime<Utc>,
        last_run_at: Option<DateTime<Utc>>,
    ) {
        let mut current = advanced.clone();
        for _ in 0..UPDATE_ATTEMPTS {
            if current.next_run_at != advanced.next_run_at {
                warn!(schedule = %advanced.name, "Entry rescheduled before rollback, keeping the new schedule");
                return;
            }
            let mut reverted = current.clone();
            reverted.next_run_at = next_run_at;
            reverted.last_run_at = last_run_at;

            match self
                .store
                .compare_and_set(&current.name, current.revision, reverted)
                .await
            {
                Ok(Some(_)) => return,
                Ok(None) => match self.store.get(&advanced.name).await {
                    Ok(fresh) => current = fresh,
                    Err(e) => {
                        error!(schedule = %advanced.name, error = %e, "Rollback failed");
                        return;
                    }
                },
                Err(e) => {
                    error!(schedule = %advanced.name, error = %e, "Rollback failed");
                    return;
                }
            }
        }
        error!(schedule = %advanced.name, "Entry kept changing, rollback abandoned");
    }

    /// Spawn the tick loop. The lease is released on shutdown.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                instance = %self.config.instance_id,
                tick_ms = self.config.tick_interval_ms,
                "Scheduler started"
            );
            let mut ticker = tokio::time::interval(self.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.tick(Utc::now()).await {
                    Ok(report) if report.enqueued() > 0 || report.failures > 0 => {
                        debug!(
                            enqueued = report.enqueued(),
                            failures = report.failures,
                            skipped = report.skipped,
                            "Scheduler tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Scheduler tick failed");
                        health().scheduler.set_unhealthy(e.to_string());
                    }
                }
            }

            self.release().await;
            info!(instance = %self.config.instance_id, "Scheduler stopped");
        })
    }

    /// Give up the lease so another instance can take over immediately.
    pub async fn release(&self) {
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            if let Err(e) = self.leases.release(&lease).await {
                warn!(error = %e, "Failed to release scheduler lease");
            }
        }
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        let entries = self.store.list().await?;
        let lease = self.lease.lock().clone();
        let leader = lease.is_some_and(|l| l.expires_at > tokio::time::Instant::now());
        Ok(SchedulerStatus {
            instance_id: self.config.instance_id.clone(),
            leader,
            last_tick_at: *self.last_tick_at.lock(),
            enabled_entries: entries.iter().filter(|e| e.enabled).count(),
            entries: entries.len(),
        })
    }

    pub async fn list(&self) -> Result<Vec<ScheduleEntry>> {
        self.store.list().await
    }

    pub async fn get(&self, name: &str) -> Result<ScheduleEntry> {
        self.store.get(name).await
    }

    pub async fn create(&self, schedule: NewSchedule) -> Result<ScheduleEntry> {
        let entry = schedule.into_entry(Utc::now())?;
        self.check_entry(&entry)?;
        self.store.create(entry.clone()).await?;
        info!(schedule = %entry.name, task_type = %entry.task_type, next_run_at = %entry.next_run_at, "Schedule created");
        Ok(entry)
    }

    /// Apply an operator edit. Retries if the entry is written meanwhile.
    pub async fn update(&self, name: &str, update: ScheduleUpdate) -> Result<ScheduleEntry> {
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.store.get(name).await?;
            let mut updated = current.clone();
            update.apply(&mut updated, Utc::now())?;
            self.check_entry(&updated)?;

            if let Some(stored) = self
                .store
                .compare_and_set(name, current.revision, updated)
                .await?
            {
                info!(schedule = %name, enabled = stored.enabled, next_run_at = %stored.next_run_at, "Schedule updated");
                return Ok(stored);
            }
        }
        Err(Error::internal(format!(
            "schedule '{}' kept changing during update",
            name
        )))
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<ScheduleEntry> {
        self.update(name, ScheduleUpdate::enabled(enabled)).await
    }

    fn check_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        if !self.producer.lanes().iter().any(|l| *l == entry.queue) {
            return Err(Error::validation(format!("unknown queue '{}'", entry.queue)));
        }
        match &self.registry {
            Some(registry) => registry.ensure_registered(std::slice::from_ref(entry)),
            None => Ok(()),
        }
    }
}
