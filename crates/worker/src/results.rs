//! Task result store.
//!
//! Results expire a fixed TTL after their last write. Reads after expiry
//! miss immediately; a sweeper evicts expired entries in the background.

use crate::config::ResultStoreConfig;
use chrono::Utc;
use engine_core::{TaskId, TaskMessage, TaskResult, TaskStatus};
use moka::future::Cache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Keyed store of task outcomes.
pub struct ResultStore {
    cache: Cache<TaskId, TaskResult>,
    /// Most recently written task ids, newest first.
    recent: Mutex<VecDeque<TaskId>>,
    config: ResultStoreConfig,
}

impl ResultStore {
    pub fn new(config: ResultStoreConfig) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl())
                .build(),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            config,
        }
    }

    pub async fn put(&self, result: TaskResult) {
        let id = result.task_id;
        self.cache.insert(id, result).await;

        let mut recent = self.recent.lock();
        recent.retain(|r| *r != id);
        recent.push_front(id);
        recent.truncate(self.config.recent_capacity);
    }

    pub async fn get(&self, id: TaskId) -> Option<TaskResult> {
        self.cache.get(&id).await
    }

    pub async fn remove(&self, id: TaskId) {
        self.cache.invalidate(&id).await;
        self.recent.lock().retain(|r| *r != id);
    }

    pub async fn mark_pending(&self, message: &TaskMessage) {
        self.put(TaskResult::pending(message)).await;
    }

    pub async fn mark_started(&self, message: &TaskMessage) {
        let now = Utc::now();
        let mut result = self.current(message).await;
        result.status = TaskStatus::Started;
        result.attempts = message.attempt + 1;
        result.started_at.get_or_insert(now);
        result.error = None;
        result.updated_at = now;
        self.put(result).await;
    }

    pub async fn mark_success(&self, message: &TaskMessage, value: serde_json::Value) {
        let now = Utc::now();
        let mut result = self.current(message).await;
        result.status = TaskStatus::Success;
        result.attempts = message.attempt + 1;
        result.result = Some(value);
        result.error = None;
        result.finished_at = Some(now);
        result.updated_at = now;
        self.put(result).await;
    }

    pub async fn mark_retry(&self, message: &TaskMessage, error: &str) {
        let mut result = self.current(message).await;
        result.status = TaskStatus::Retry;
        result.attempts = message.attempt + 1;
        result.error = Some(error.to_string());
        result.updated_at = Utc::now();
        self.put(result).await;
    }

    pub async fn mark_failure(&self, message: &TaskMessage, error: &str) {
        let now = Utc::now();
        let mut result = self.current(message).await;
        result.status = TaskStatus::Failure;
        result.attempts = message.attempt + 1;
        result.error = Some(error.to_string());
        result.finished_at = Some(now);
        result.updated_at = now;
        self.put(result).await;
    }

    /// Existing record, or a fresh one when it expired or was never written.
    async fn current(&self, message: &TaskMessage) -> TaskResult {
        self.get(message.id)
            .await
            .unwrap_or_else(|| TaskResult::pending(message))
    }

    /// Latest results still in the store, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TaskResult> {
        let ids: Vec<TaskId> = self.recent.lock().iter().copied().collect();
        let mut results = Vec::with_capacity(limit.min(ids.len()));
        for id in ids {
            if results.len() >= limit {
                break;
            }
            if let Some(result) = self.cache.get(&id).await {
                results.push(result);
            }
        }
        results
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Evict expired entries now.
    pub async fn sweep(&self) {
        self.cache.run_pending_tasks().await;
        let ids: Vec<TaskId> = self.recent.lock().iter().copied().collect();
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            if self.cache.contains_key(&id) {
                live.push(id);
            }
        }
        let mut recent = self.recent.lock();
        recent.retain(|id| live.contains(id));
        debug!(entries = self.cache.entry_count(), "Result store swept");
    }

    /// Spawn the periodic sweeper.
    pub fn start_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(ttl_secs: u64) -> ResultStore {
        ResultStore::new(ResultStoreConfig {
            ttl_secs,
            recent_capacity: 3,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let results = store(60);
        let message = TaskMessage::new("send_email", serde_json::json!({}));

        results.mark_pending(&message).await;
        assert_eq!(results.get(message.id).await.unwrap().status, TaskStatus::Pending);

        results.mark_started(&message).await;
        let started = results.get(message.id).await.unwrap();
        assert_eq!(started.status, TaskStatus::Started);
        assert_eq!(started.attempts, 1);

        results.mark_retry(&message, "smtp timeout").await;
        let retry = message.next_attempt(Utc::now()).unwrap();
        results.mark_started(&retry).await;
        results.mark_success(&retry, serde_json::json!("ok")).await;

        let done = results.get(message.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.started_at, started.started_at);
        assert!(done.finished_at.is_some());
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        assert!(store(60).get(TaskId::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_recent_is_bounded_newest_first() {
        let results = store(60);
        let messages: Vec<TaskMessage> = (0..5)
            .map(|n| TaskMessage::new("noop", serde_json::json!(n)))
            .collect();
        for m in &messages {
            results.mark_pending(m).await;
        }
        results.mark_started(&messages[2]).await;

        let recent: Vec<TaskId> = results.recent(10).await.iter().map(|r| r.task_id).collect();
        assert_eq!(recent, vec![messages[2].id, messages[4].id, messages[3].id]);
    }

    #[tokio::test]
    async fn test_expiry() {
        let results = store(1);
        let message = TaskMessage::new("noop", serde_json::Value::Null);
        results.mark_pending(&message).await;
        assert!(results.get(message.id).await.is_some());

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(results.get(message.id).await.is_none());

        results.sweep().await;
        assert!(results.recent(10).await.is_empty());
    }
}
