//! Bounded-concurrency worker pool.
//!
//! One dispatch loop pulls messages in strict lane priority. Each accepted
//! message holds a semaphore permit until its outcome is recorded and the
//! broker has been told about it.
//!
//! While a handler runs, the pool keeps extending the delivery's visibility
//! so the broker does not hand the message to another worker. Outcomes are
//! settled with the delivery receipt first and recorded only if the broker
//! still considers this delivery the owner.

use crate::config::PoolConfig;
use crate::handler::{HandlerRegistry, TaskContext};
use crate::results::ResultStore;
use broker::{dequeue_prioritized, Broker, Delivery, Nack, Receipt, Settlement};
use chrono::{DateTime, Utc};
use engine_core::{Error, Result, RetryPolicy, TaskMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::{health, metrics};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Backoff for broker calls made by the pool itself.
const BROKER_RETRY: RetryPolicy = RetryPolicy {
    max_retries: 5,
    base_delay_ms: 100,
    max_delay_ms: 5_000,
};

/// Pool activity for the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub concurrency: usize,
    pub active: usize,
    pub available_permits: usize,
    pub lanes: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Terminal outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Retried,
    DeadLettered,
    Discarded,
    /// The message was redelivered to another worker before this attempt
    /// settled; its outcome was not recorded.
    Superseded,
}

pub struct WorkerPool {
    config: PoolConfig,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    results: Arc<ResultStore>,
    visibility_timeout: Duration,
    semaphore: Arc<Semaphore>,
    active: AtomicUsize,
    heartbeat: Mutex<Option<DateTime<Utc>>>,
    /// Cancelled when in-flight handlers must stop (shutdown timeout).
    handlers_cancel: CancellationToken,
    running: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        results: Arc<ResultStore>,
        visibility_timeout: Duration,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            config: PoolConfig {
                concurrency,
                ..config
            },
            broker,
            registry,
            results,
            visibility_timeout,
            active: AtomicUsize::new(0),
            heartbeat: Mutex::new(None),
            handlers_cancel: CancellationToken::new(),
            running: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            concurrency: self.config.concurrency,
            active: self.active(),
            available_permits: self.semaphore.available_permits(),
            lanes: self.config.lanes.clone(),
            last_heartbeat: *self.heartbeat.lock(),
            running: !self.running.is_cancelled(),
        }
    }

    fn beat(&self) {
        *self.heartbeat.lock() = Some(Utc::now());
    }

    /// Spawn the dispatch loop. On cancel the pool stops pulling, then waits
    /// up to the shutdown timeout for in-flight tasks.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                concurrency = self.config.concurrency,
                lanes = ?self.config.lanes,
                "Worker pool started"
            );
            self.dispatch_loop(&cancel).await;
            self.shutdown().await;
        })
    }

    async fn dispatch_loop(self: &Arc<Self>, cancel: &CancellationToken) {
        let mut outage_attempt = 0u32;

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            self.beat();

            let dequeued =
                dequeue_prioritized(self.broker.as_ref(), &self.config.lanes, self.visibility_timeout)
                    .await;
            if dequeued.is_ok() && outage_attempt > 0 {
                info!("Broker reachable again");
                health().broker.set_healthy();
                outage_attempt = 0;
            }

            match dequeued {
                Ok(Some(delivery)) => {
                    let pool = self.clone();
                    tokio::spawn(async move {
                        pool.execute(delivery, permit).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    metrics().broker_errors.inc();
                    health().broker.set_unhealthy(e.to_string());
                    let delay = BROKER_RETRY.backoff(outage_attempt);
                    warn!(error = %e, delay_ms = %delay.as_millis(), "Dequeue failed, backing off");
                    outage_attempt = outage_attempt.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Wait for every permit to come back, cancelling handlers if the
    /// timeout passes first.
    async fn shutdown(&self) {
        self.running.cancel();
        let total = self.config.concurrency as u32;
        info!(active = self.active(), "Worker pool draining");

        match tokio::time::timeout(
            self.config.shutdown_timeout(),
            self.semaphore.acquire_many(total),
        )
        .await
        {
            Ok(_) => info!("Worker pool stopped"),
            Err(_) => {
                warn!(
                    active = self.active(),
                    "Shutdown timeout elapsed, cancelling in-flight tasks"
                );
                self.handlers_cancel.cancel();
            }
        }
    }

    /// Run one delivery to a recorded outcome.
    pub async fn execute(&self, delivery: Delivery, permit: OwnedSemaphorePermit) -> Disposition {
        let _permit = permit;
        let Delivery { message, receipt } = delivery;
        self.active.fetch_add(1, Ordering::SeqCst);
        metrics().active_workers.inc();
        metrics().tasks_started.inc();

        let start = std::time::Instant::now();
        self.results.mark_started(&message).await;
        debug!(task_id = %message.id, task_type = %message.task_type, attempt = message.attempt, "Task started");

        let outcome = self.run_with_lease(&message, receipt).await;
        metrics()
            .task_latency_ms
            .observe(start.elapsed().as_millis() as u64);

        let disposition = match outcome {
            Ok(value) => self.succeed(&message, receipt, value).await,
            Err(e) => self.fail(&message, receipt, e).await,
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        metrics().active_workers.dec();
        disposition
    }

    /// Run the handler, extending the delivery's visibility every half
    /// timeout until it returns.
    async fn run_with_lease(&self, message: &TaskMessage, receipt: Receipt) -> Result<serde_json::Value> {
        let period = (self.visibility_timeout / 2).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handler = self.run_handler(message);
        tokio::pin!(handler);
        loop {
            tokio::select! {
                outcome = &mut handler => return outcome,
                _ = renew.tick() => self.extend_visibility(receipt).await,
            }
        }
    }

    async fn extend_visibility(&self, receipt: Receipt) {
        match self.broker.extend(receipt, self.visibility_timeout).await {
            Ok(Settlement::Applied) => {}
            Ok(Settlement::Stale) => {
                warn!(receipt = %receipt, "Delivery expired while the handler was running; the task may run twice");
            }
            Err(e) => {
                metrics().broker_errors.inc();
                warn!(receipt = %receipt, error = %e, "Visibility extension failed");
            }
        }
    }

    async fn run_handler(&self, message: &TaskMessage) -> Result<serde_json::Value> {
        let Some(handler) = self.registry.get(&message.task_type) else {
            return Err(Error::UnknownTaskType(message.task_type.clone()));
        };

        let budget = self.config.task_deadline();
        let cancel = self.handlers_cancel.child_token();
        let ctx = TaskContext::new(message, Instant::now() + budget, cancel.clone());
        let payload = message.payload.clone();

        // Spawned so a panic surfaces as a JoinError instead of unwinding here.
        let mut handle = tokio::spawn(async move { handler.call(ctx, payload).await });

        let joined = match tokio::time::timeout(budget, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                metrics().deadlines_exceeded.inc();
                warn!(task_id = %message.id, task_type = %message.task_type, deadline_ms = %budget.as_millis(), "Deadline exceeded, waiting for handler to stop");
                match handle.await {
                    Ok(Ok(_)) => {
                        debug!(task_id = %message.id, "Handler returned after its deadline, result discarded");
                    }
                    Ok(Err(e)) => {
                        debug!(task_id = %message.id, error = %e, "Handler failed after its deadline");
                    }
                    Err(e) => {
                        self.join_failure(message, e);
                    }
                }
                return Err(Error::DeadlineExceeded(budget));
            }
        };

        joined.unwrap_or_else(|e| Err(self.join_failure(message, e)))
    }

    fn join_failure(&self, message: &TaskMessage, err: JoinError) -> Error {
        if err.is_panic() {
            let panic = err.into_panic();
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            metrics().handler_panics.inc();
            error!(task_id = %message.id, task_type = %message.task_type, panic = %detail, "Handler panicked");
            Error::handler(format!("handler panicked: {}", detail))
        } else {
            Error::handler("handler task was cancelled")
        }
    }

    async fn succeed(&self, message: &TaskMessage, receipt: Receipt, value: serde_json::Value) -> Disposition {
        if !self.settle(message, receipt, None).await {
            return Disposition::Superseded;
        }
        self.results.mark_success(message, value).await;
        metrics().tasks_succeeded.inc();
        info!(task_id = %message.id, task_type = %message.task_type, attempts = message.attempt + 1, "Task succeeded");
        Disposition::Succeeded
    }

    async fn fail(&self, message: &TaskMessage, receipt: Receipt, err: Error) -> Disposition {
        let reason = err.to_string();

        // Per-message retries, capped by the pool's own retry budget.
        if err.is_retryable() && self.config.retry.allows(message.attempt + 1) {
            let delay = self.config.retry.backoff(message.attempt);
            let eta = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            if let Some(next) = message.next_attempt(eta) {
                let retries_remaining = next.retries_remaining;
                if !self.settle(message, receipt, Some(Nack::Retry(next))).await {
                    return Disposition::Superseded;
                }
                self.results.mark_retry(message, &reason).await;
                metrics().tasks_retried.inc();
                warn!(
                    task_id = %message.id,
                    task_type = %message.task_type,
                    attempt = message.attempt + 1,
                    retries_remaining,
                    delay_ms = %delay.as_millis(),
                    error = %reason,
                    "Task failed, retrying"
                );
                return Disposition::Retried;
            }
        }

        let settle = if self.config.dead_letter {
            Some(Nack::DeadLetter { reason: reason.clone() })
        } else {
            None
        };
        if !self.settle(message, receipt, settle).await {
            return Disposition::Superseded;
        }
        self.results.mark_failure(message, &reason).await;
        metrics().tasks_failed.inc();

        if self.config.dead_letter {
            metrics().tasks_dead_lettered.inc();
            Disposition::DeadLettered
        } else {
            error!(task_id = %message.id, task_type = %message.task_type, error = %reason, "Task failed, discarding");
            Disposition::Discarded
        }
    }

    /// Ack (`None`) or nack under `receipt`, retrying broker outages. If the
    /// broker stays down the message is redelivered once its visibility
    /// timeout lapses.
    ///
    /// Returns `false` when another delivery owns the message; the caller
    /// must not record this attempt's outcome.
    async fn settle(&self, message: &TaskMessage, receipt: Receipt, nack: Option<Nack>) -> bool {
        let mut attempt = 0;
        loop {
            let result = match &nack {
                None => self.broker.ack(receipt).await,
                Some(disposition) => self.broker.nack(receipt, disposition.clone()).await,
            };
            match result {
                Ok(Settlement::Applied) => return true,
                Ok(Settlement::Stale) => {
                    metrics().stale_deliveries.inc();
                    warn!(
                        task_id = %message.id,
                        task_type = %message.task_type,
                        receipt = %receipt,
                        "Message was redelivered before this attempt settled, outcome discarded"
                    );
                    return false;
                }
                Err(e) if e.is_transient() && BROKER_RETRY.allows(attempt + 1) => {
                    metrics().broker_errors.inc();
                    let delay = BROKER_RETRY.backoff(attempt);
                    warn!(task_id = %message.id, error = %e, delay_ms = %delay.as_millis(), "Broker settle failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(task_id = %message.id, error = %e, "Broker settle failed; message will be redelivered");
                    return true;
                }
            }
        }
    }
}
