//! In-process broker.
//!
//! Keeps every lane in memory behind a single mutex. Messages are stored
//! encoded, the same bytes a networked transport would carry.

use crate::broker::{Broker, DeadLetter, Delivery, Nack, QueueDepth, Receipt, Settlement};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engine_core::limits::DEAD_LETTER_QUEUE;
use engine_core::{Error, Result, TaskId, TaskMessage};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use telemetry::metrics;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Position inside a lane: higher priority first, then arrival order.
type LaneKey = (Reverse<u8>, u64);

struct Stored {
    queue: String,
    key: LaneKey,
    encoded: Vec<u8>,
}

struct InFlight {
    delivery: u64,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    seq: u64,
    deliveries: u64,
    ready: HashMap<String, BTreeMap<LaneKey, TaskId>>,
    delayed: BTreeMap<(DateTime<Utc>, u64), TaskId>,
    messages: HashMap<TaskId, Stored>,
    in_flight: HashMap<TaskId, InFlight>,
    dead: VecDeque<DeadLetter>,
}

impl State {
    fn insert(&mut self, message: &TaskMessage, encoded: Vec<u8>, now: DateTime<Utc>) {
        self.seq += 1;
        let key = (Reverse(message.priority), self.seq);

        match message.eta {
            Some(eta) if !message.is_due(now) => {
                self.delayed.insert((eta, self.seq), message.id);
            }
            _ => {
                self.ready
                    .entry(message.queue.clone())
                    .or_default()
                    .insert(key, message.id);
            }
        }

        self.messages.insert(
            message.id,
            Stored {
                queue: message.queue.clone(),
                key,
                encoded,
            },
        );
    }

    /// Put a known message back at its original lane position.
    fn make_visible(&mut self, id: TaskId) {
        if let Some(stored) = self.messages.get(&id) {
            self.ready
                .entry(stored.queue.clone())
                .or_default()
                .insert(stored.key, id);
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.make_visible(id);
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<TaskId> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.in_flight.remove(&id);
            warn!(task_id = %id, "Visibility timeout elapsed, message redelivered");
            self.make_visible(id);
        }
    }

    /// The in-flight entry `receipt` refers to, if it still owns it.
    fn owned(&mut self, receipt: Receipt) -> Option<&mut InFlight> {
        self.in_flight
            .get_mut(&receipt.id)
            .filter(|lease| lease.delivery == receipt.delivery)
    }

    fn take_in_flight(&mut self, id: TaskId) -> Option<Stored> {
        self.in_flight.remove(&id)?;
        self.messages.remove(&id)
    }
}

/// In-memory [`Broker`] implementation.
pub struct MemoryBroker {
    config: BrokerConfig,
    available: AtomicBool,
    state: Mutex<State>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            available: AtomicBool::new(true),
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Simulate a transport outage (or recovery).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::broker_unavailable("broker is not accepting requests"))
        }
    }

    fn push_dead(&self, state: &mut State, letter: DeadLetter) {
        state.dead.push_front(letter);
        let capacity = self.config.dead_letter_capacity.max(1);
        while state.dead.len() > capacity {
            if let Some(evicted) = state.dead.pop_back() {
                metrics().dead_letters_evicted.inc();
                error!(
                    task_id = %evicted.message.id,
                    task_type = %evicted.message.task_type,
                    reason = %evicted.reason,
                    dead_at = %evicted.dead_at,
                    capacity,
                    "Dead-letter queue full, evicting oldest entry"
                );
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: &TaskMessage) -> Result<()> {
        self.ensure_available()?;
        let encoded = message.encode()?;

        let mut state = self.state.lock();
        if state.messages.contains_key(&message.id) {
            return Err(Error::validation(format!(
                "message {} is already enqueued",
                message.id
            )));
        }
        state.insert(message, encoded, Utc::now());

        debug!(task_id = %message.id, queue = %message.queue, task_type = %message.task_type, "Enqueued");
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Delivery>> {
        self.ensure_available()?;
        let now = Instant::now();

        let mut state = self.state.lock();
        state.promote_due(Utc::now());
        state.reclaim_expired(now);

        let Some((_, id)) = state.ready.get_mut(queue).and_then(|lane| lane.pop_first()) else {
            return Ok(None);
        };

        let Some(stored) = state.messages.get(&id) else {
            return Err(Error::internal(format!("message {} missing from store", id)));
        };
        let message = TaskMessage::decode(&stored.encoded)?;

        state.deliveries += 1;
        let delivery = state.deliveries;
        state.in_flight.insert(
            id,
            InFlight {
                delivery,
                deadline: now + visibility_timeout,
            },
        );

        Ok(Some(Delivery {
            message,
            receipt: Receipt { id, delivery },
        }))
    }

    async fn ack(&self, receipt: Receipt) -> Result<Settlement> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        if state.owned(receipt).is_none() {
            debug!(receipt = %receipt, "Ack with stale receipt");
            return Ok(Settlement::Stale);
        }
        state.take_in_flight(receipt.id);
        Ok(Settlement::Applied)
    }

    async fn nack(&self, receipt: Receipt, disposition: Nack) -> Result<Settlement> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        if state.owned(receipt).is_none() {
            debug!(receipt = %receipt, "Nack with stale receipt");
            return Ok(Settlement::Stale);
        }
        let id = receipt.id;

        match disposition {
            Nack::Requeue => {
                state.in_flight.remove(&id);
                state.make_visible(id);
            }
            Nack::Retry(updated) => {
                if updated.id != id {
                    return Err(Error::validation(format!(
                        "retry copy {} does not match message {}",
                        updated.id, id
                    )));
                }
                let encoded = updated.encode()?;
                state.take_in_flight(id);
                state.insert(&updated, encoded, Utc::now());
            }
            Nack::DeadLetter { reason } => {
                let Some(stored) = state.take_in_flight(id) else {
                    return Ok(Settlement::Stale);
                };
                let message = TaskMessage::decode(&stored.encoded)?;
                error!(task_id = %id, task_type = %message.task_type, reason = %reason, "Task dead-lettered");
                self.push_dead(
                    &mut state,
                    DeadLetter {
                        message,
                        reason,
                        dead_at: Utc::now(),
                    },
                );
            }
        }
        Ok(Settlement::Applied)
    }

    async fn extend(&self, receipt: Receipt, visibility_timeout: Duration) -> Result<Settlement> {
        self.ensure_available()?;
        let deadline = Instant::now() + visibility_timeout;
        let mut state = self.state.lock();
        match state.owned(receipt) {
            Some(lease) => {
                lease.deadline = deadline;
                Ok(Settlement::Applied)
            }
            None => Ok(Settlement::Stale),
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
        self.ensure_available()?;
        let mut state = self.state.lock();

        if queue == DEAD_LETTER_QUEUE {
            return Ok(QueueDepth {
                ready: state.dead.len(),
                delayed: 0,
            });
        }

        state.promote_due(Utc::now());
        let ready = state.ready.get(queue).map_or(0, BTreeMap::len);
        let delayed = state
            .delayed
            .values()
            .filter(|id| state.messages.get(id).is_some_and(|s| s.queue == queue))
            .count();

        Ok(QueueDepth { ready, delayed })
    }

    async fn in_flight_count(&self) -> Result<usize> {
        self.ensure_available()?;
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.in_flight.values().filter(|lease| lease.deadline > now).count())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.ensure_available()?;
        let state = self.state.lock();
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_available()
    }
}
