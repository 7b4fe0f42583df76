//! Typed task handlers and the registry that maps task types to them.

use async_trait::async_trait;
use engine_core::{Error, Result, ScheduleEntry, TaskId, TaskMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a handler.
///
/// The token is cancelled when the attempt's deadline passes or the pool
/// shuts down. Handlers are never aborted; long-running ones should call
/// [`TaskContext::checkpoint`] between steps.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    pub retries_remaining: u32,
    deadline: Instant,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(message: &TaskMessage, deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            task_id: message.id,
            task_type: message.task_type.clone(),
            attempt: message.attempt,
            retries_remaining: message.retries_remaining,
            deadline,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt should stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Returns `DeadlineExceeded` once cancelled.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::DeadlineExceeded(self.elapsed_budget()))
        } else {
            Ok(())
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn elapsed_budget(&self) -> Duration {
        Instant::now().saturating_duration_since(self.deadline)
    }
}

/// A typed task.
///
/// Arguments are decoded from the message payload before `run` is called;
/// a payload that does not decode fails the task without retry.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Task type name as carried in messages.
    const NAME: &'static str;

    type Args: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn run(&self, ctx: TaskContext, args: Self::Args) -> Result<Self::Output>;
}

/// Type-erased handler stored in the registry.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: TaskContext, payload: serde_json::Value) -> Result<serde_json::Value>;
}

struct Typed<T>(T);

#[async_trait]
impl<T: Task> Handler for Typed<T> {
    async fn call(&self, ctx: TaskContext, payload: serde_json::Value) -> Result<serde_json::Value> {
        let args: T::Args = serde_json::from_value(payload)
            .map_err(|e| Error::serialization(format!("{} arguments: {}", T::NAME, e)))?;
        let output = self.0.run(ctx, args).await?;
        Ok(serde_json::to_value(output)?)
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext, payload: serde_json::Value) -> Result<serde_json::Value> {
        (self.0)(ctx, payload).await
    }
}

/// Task type to handler mapping, fixed before the pool starts.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(&mut self, task: T) -> Result<()> {
        self.insert(T::NAME, Arc::new(Typed(task)))
    }

    /// Register a closure over the raw JSON payload.
    pub fn register_fn<F, Fut>(&mut self, task_type: &str, f: F) -> Result<()>
    where
        F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        self.insert(task_type, Arc::new(FnHandler(f)))
    }

    fn insert(&mut self, task_type: &str, handler: Arc<dyn Handler>) -> Result<()> {
        if self.handlers.contains_key(task_type) {
            return Err(Error::DuplicateHandler(task_type.to_string()));
        }
        self.handlers.insert(task_type.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Fail on the first schedule entry whose task type has no handler.
    pub fn ensure_registered(&self, entries: &[ScheduleEntry]) -> Result<()> {
        match entries.iter().find(|e| !self.contains(&e.task_type)) {
            Some(entry) => Err(Error::UnknownTaskType(format!(
                "{} (schedule '{}')",
                entry.task_type, entry.name
            ))),
            None => Ok(()),
        }
    }
}
