//! Periodic schedule entries and cadence arithmetic.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{Error, Result};
use crate::limits::{DEFAULT_PRIORITY, DEFAULT_QUEUE, DEFAULT_RETRIES};

/// How often an entry fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Cadence {
    /// Fixed interval in seconds.
    Interval { seconds: u64 },
    /// Cron expression with a leading seconds field
    /// (`sec min hour day-of-month month day-of-week [year]`).
    Cron { expression: String },
}

impl Cadence {
    pub fn every(seconds: u64) -> Self {
        Self::Interval { seconds }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self::Cron {
            expression: expression.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Interval { seconds: 0 } => Err(Error::InvalidCadence {
                expr: "0s".into(),
                message: "interval must be at least one second".into(),
            }),
            Self::Interval { .. } => Ok(()),
            Self::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First occurrence strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::Interval { seconds } => {
                let too_large = || Error::InvalidCadence {
                    expr: format!("{}s", seconds),
                    message: "interval too large".into(),
                };
                let step = i64::try_from((*seconds).max(1))
                    .ok()
                    .and_then(Duration::try_seconds)
                    .ok_or_else(too_large)?;
                from.checked_add_signed(step).ok_or_else(too_large)
            }
            Self::Cron { expression } => parse_cron(expression)?
                .after(&from)
                .next()
                .ok_or_else(|| Error::InvalidCadence {
                    expr: expression.clone(),
                    message: "expression has no future occurrence".into(),
                }),
        }
    }
}

fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(expression).map_err(|e| Error::InvalidCadence {
        expr: expression.to_string(),
        message: e.to_string(),
    })
}

/// A persistent periodic-task register entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScheduleEntry {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 128))]
    pub task_type: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub payload_template: serde_json::Value,
    pub cadence: Cadence,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fire once per missed occurrence instead of once per recovery.
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub priority: u8,
    /// Bumped by the store on every write. Compare-and-set checks it, so a
    /// write based on a stale read never lands.
    #[serde(default)]
    pub revision: u64,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

/// The outcome of evaluating a due entry at one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FiringPlan {
    /// Occurrences to enqueue, oldest first. Always at least one.
    pub occurrences: Vec<DateTime<Utc>>,
    /// Occurrences skipped (not backfilled) on this tick.
    pub skipped: usize,
    pub last_run_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Creates an enabled entry whose first occurrence follows `now`.
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        payload_template: serde_json::Value,
        cadence: Cadence,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        cadence.validate()?;
        let next_run_at = cadence.next_after(now)?;
        let entry = Self {
            name: name.into(),
            task_type: task_type.into(),
            queue: default_queue(),
            payload_template,
            cadence,
            last_run_at: None,
            next_run_at,
            enabled: true,
            catch_up: false,
            retries: DEFAULT_RETRIES,
            priority: DEFAULT_PRIORITY,
            revision: 0,
        };
        entry.check()?;
        Ok(entry)
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_catch_up(mut self, catch_up: bool) -> Self {
        self.catch_up = catch_up;
        self
    }

    /// Field and cadence validation.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::validation(format!("schedule: {}", e)))?;
        self.cadence.validate()?;
        if let Some(last) = self.last_run_at {
            if self.next_run_at < last {
                return Err(Error::validation("next_run_at precedes last_run_at"));
            }
        }
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now
    }

    /// Recompute `next_run_at` after a cadence change.
    ///
    /// Never moves earlier than the last firing.
    pub fn reschedule(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.cadence.validate()?;
        let from = self.last_run_at.map_or(now, |last| last.max(now));
        self.next_run_at = self.cadence.next_after(from)?;
        Ok(())
    }

    /// Work out what firing this entry at `now` means.
    ///
    /// Without catch-up a due entry fires exactly once, however many
    /// occurrences were missed, and the next occurrence is computed forward
    /// from `now`. With catch-up each missed occurrence fires, up to `cap`
    /// per tick.
    pub fn plan_firings(&self, now: DateTime<Utc>, cap: usize) -> Result<Option<FiringPlan>> {
        if !self.is_due(now) {
            return Ok(None);
        }

        let cap = cap.max(1);
        let mut occurrences = vec![self.next_run_at];
        let mut skipped = 0;
        let mut next = self.cadence.next_after(self.next_run_at)?;

        if self.catch_up {
            while next <= now && occurrences.len() < cap {
                occurrences.push(next);
                next = self.cadence.next_after(next)?;
            }
        }

        if next <= now {
            // Still behind: resume from now rather than bursting.
            skipped = self.count_between(next, now)?;
            next = self.cadence.next_after(now)?;
        }

        Ok(Some(FiringPlan {
            occurrences,
            skipped,
            last_run_at: now,
            next_run_at: next,
        }))
    }

    fn count_between(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<usize> {
        match &self.cadence {
            Cadence::Interval { seconds } => {
                let span = (until - from).num_seconds().max(0) as u64;
                Ok((span / (*seconds).max(1)) as usize + 1)
            }
            Cadence::Cron { .. } => {
                let mut count = 0;
                let mut cursor = from;
                while cursor <= until && count < 10_000 {
                    count += 1;
                    cursor = self.cadence.next_after(cursor)?;
                }
                Ok(count)
            }
        }
    }
}
