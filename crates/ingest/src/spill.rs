//! Local spill area for batches the store would not accept.
//!
//! Each spilled batch becomes one JSON-lines file. File names sort in
//! spill order so replay preserves arrival order.

use chrono::Utc;
use engine_core::{Error, Record, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

const EXTENSION: &str = "jsonl";

/// Directory of spilled batches.
pub struct SpillDir {
    dir: PathBuf,
    seq: AtomicU64,
}

impl SpillDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write a batch as JSON lines. Returns the file written.
    pub async fn write(&self, records: &[Record]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::Spill(format!("create {}: {}", self.dir.display(), e)))?;

        let mut body = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "batch-{}-{:06}.{}",
            Utc::now().format("%Y%m%dT%H%M%S%.9f"),
            seq,
            EXTENSION
        );
        let path = self.dir.join(name);

        // Write then rename so replay never sees a partial file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| Error::Spill(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Spill(format!("rename {}: {}", path.display(), e)))?;

        info!(path = %path.display(), records = records.len(), "Spilled batch");
        Ok(path)
    }

    /// Spilled batch files, oldest first.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Spill(format!("read {}: {}", self.dir.display(), e))),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Spill(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Read one spilled batch. Malformed lines are skipped with a warning.
    pub async fn read(&self, path: &Path) -> Result<Vec<Record>> {
        let body = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Spill(format!("read {}: {}", path.display(), e)))?;

        let mut records = Vec::new();
        for (lineno, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), line = lineno + 1, error = %e, "Skipping malformed spilled record"),
            }
        }
        Ok(records)
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::Spill(format!("remove {}: {}", path.display(), e)))
    }
}
