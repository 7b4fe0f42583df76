//! Persistent register of schedule entries.

use async_trait::async_trait;
use engine_core::{Error, Result, ScheduleEntry};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Storage for schedule entries.
///
/// `compare_and_set` is the only write after creation. An entry is replaced
/// only while its `revision` still equals the one the writer read, so two
/// scheduler instances can never both advance the same occurrence, and a
/// tick never overwrites an operator edit it did not see.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All entries, ordered by name.
    async fn list(&self) -> Result<Vec<ScheduleEntry>>;

    async fn get(&self, name: &str) -> Result<ScheduleEntry>;

    /// Add a new entry. Fails if the name is taken.
    async fn create(&self, entry: ScheduleEntry) -> Result<()>;

    /// Store `updated` if the entry is still at `expected_revision`.
    /// Returns the stored entry (revision bumped), or `None` on conflict.
    async fn compare_and_set(
        &self,
        name: &str,
        expected_revision: u64,
        updated: ScheduleEntry,
    ) -> Result<Option<ScheduleEntry>>;
}

/// In-memory register, optionally mirrored to a JSON file.
pub struct MemoryScheduleStore {
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
    path: Option<PathBuf>,
}

impl Default for MemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open a file-backed register, loading any entries already saved.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<ScheduleEntry> = serde_json::from_slice(&bytes)?;
                for entry in &list {
                    entry.check()?;
                }
                list.into_iter().map(|e| (e.name.clone(), e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::internal(format!(
                    "read schedule register {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(path = %path.display(), entries = entries.len(), "Schedule register loaded");
        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, ScheduleEntry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let list: Vec<&ScheduleEntry> = entries.values().collect();
        let body = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::internal(format!("create {}: {}", parent.display(), e)))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::internal(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::internal(format!("rename {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), entries = entries.len(), "Schedule register saved");
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn list(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.entries.lock().await.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<ScheduleEntry> {
        self.entries
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ScheduleNotFound(name.to_string()))
    }

    async fn create(&self, entry: ScheduleEntry) -> Result<()> {
        entry.check()?;
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&entry.name) {
            return Err(Error::validation(format!(
                "schedule '{}' already exists",
                entry.name
            )));
        }
        entries.insert(entry.name.clone(), entry);
        self.persist(&entries).await
    }

    async fn compare_and_set(
        &self,
        name: &str,
        expected_revision: u64,
        mut updated: ScheduleEntry,
    ) -> Result<Option<ScheduleEntry>> {
        updated.check()?;
        let mut entries = self.entries.lock().await;
        let Some(current) = entries.get(name) else {
            return Err(Error::ScheduleNotFound(name.to_string()));
        };
        if current.revision != expected_revision {
            return Ok(None);
        }
        updated.revision = expected_revision + 1;
        entries.insert(name.to_string(), updated.clone());
        self.persist(&entries).await?;
        Ok(Some(updated))
    }
}
