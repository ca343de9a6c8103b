//! JSONL checkpoint file
//!
//! The first line is a header naming the run; every further line is one
//! [`CheckpointEntry`]. Appends are serialized by a mutex and synced before
//! `mark_done` returns. A torn trailing line (crash mid-write) is cut off when
//! the file is reopened.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{summarize, CheckpointEntry, CheckpointStore, CheckpointSummary};
use crate::storage::{StorageError, StorageResult};

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointHeader {
    run: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct FileState {
    file: Option<File>,
    done: HashMap<String, CheckpointEntry>,
}

#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    run_name: String,
    state: Mutex<FileState>,
}

impl FileCheckpointStore {
    /// Open the checkpoint for `run_name`, creating it if absent
    pub async fn open(path: impl Into<PathBuf>, run_name: &str) -> StorageResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let done = match fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => {
                Self::load(&path, run_name, &content).await?
            }
            Ok(_) => {
                Self::write_header(&path, run_name).await?;
                HashMap::new()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::write_header(&path, run_name).await?;
                HashMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new().append(true).open(&path).await?;
        debug!(run = run_name, completed = done.len(), "Opened checkpoint");

        Ok(Self {
            path,
            run_name: run_name.to_string(),
            state: Mutex::new(FileState {
                file: Some(file),
                done,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_header(path: &Path, run_name: &str) -> StorageResult<()> {
        let header = CheckpointHeader {
            run: run_name.to_string(),
            created_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        let mut file = File::create(path).await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn load(
        path: &Path,
        run_name: &str,
        content: &str,
    ) -> StorageResult<HashMap<String, CheckpointEntry>> {
        // Everything after the last newline was never completely written
        let complete_len = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
        if complete_len < content.len() {
            warn!(
                path = %path.display(),
                "Discarding torn trailing checkpoint line"
            );
            let file = OpenOptions::new().write(true).open(path).await?;
            file.set_len(complete_len as u64).await?;
            file.sync_all().await?;
        }

        let mut lines = content[..complete_len].lines();
        let header: CheckpointHeader = match lines.next() {
            Some(line) => serde_json::from_str(line)?,
            None => {
                Self::write_header(path, run_name).await?;
                return Ok(HashMap::new());
            }
        };
        if header.run != run_name {
            return Err(StorageError::conflict(format!(
                "checkpoint {} belongs to run {}, not {}",
                path.display(),
                header.run,
                run_name
            )));
        }

        let mut done = HashMap::new();
        for (number, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: CheckpointEntry = serde_json::from_str(line).map_err(|e| {
                StorageError::serialization(format!("checkpoint line {}: {}", number + 2, e))
            })?;
            done.insert(entry.attendee_id.clone(), entry);
        }
        Ok(done)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn mark_done(&self, entry: CheckpointEntry) -> StorageResult<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut state = self.state.lock().await;
        let file = state
            .file
            .as_mut()
            .ok_or_else(|| StorageError::conflict("checkpoint has been cleared"))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        state.done.insert(entry.attendee_id.clone(), entry);
        Ok(())
    }

    async fn is_done(&self, attendee_id: &str) -> bool {
        self.state.lock().await.done.contains_key(attendee_id)
    }

    async fn list_done(&self) -> HashMap<String, CheckpointEntry> {
        self.state.lock().await.done.clone()
    }

    async fn summary(&self) -> CheckpointSummary {
        summarize(&self.run_name, self.state.lock().await.done.values())
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.file = None;
        state.done.clear();
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointOutcome;
    use crate::model::DetailRecord;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.jsonl");

        {
            let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
            store
                .mark_done(CheckpointEntry::fetched("A", 0, DetailRecord::default()))
                .await
                .unwrap();
            store
                .mark_done(CheckpointEntry::unavailable("B", 4, "timed out"))
                .await
                .unwrap();
        }

        let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
        assert!(store.is_done("A").await);
        assert!(store.is_done("B").await);
        assert!(!store.is_done("C").await);

        let summary = store.summary().await;
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.unavailable, 1);
        assert_eq!(summary.last_index, Some(4));
        assert!(matches!(
            store.list_done().await["B"].outcome,
            CheckpointOutcome::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.jsonl");
        let store = Arc::new(FileCheckpointStore::open(&path, "run-1").await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .mark_done(CheckpointEntry::fetched(format!("id-{}", i), i, DetailRecord::default()))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        drop(store);

        let reopened = FileCheckpointStore::open(&path, "run-1").await.unwrap();
        assert_eq!(reopened.list_done().await.len(), 32);
    }

    #[tokio::test]
    async fn test_torn_trailing_line_is_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.jsonl");
        {
            let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
            store
                .mark_done(CheckpointEntry::fetched("A", 0, DetailRecord::default()))
                .await
                .unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str(r#"{"attendee_id":"B","ind"#);
        std::fs::write(&path, content).unwrap();

        let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
        assert_eq!(store.list_done().await.len(), 1);
        store
            .mark_done(CheckpointEntry::fetched("C", 2, DetailRecord::default()))
            .await
            .unwrap();
        drop(store);

        let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
        assert!(store.is_done("A").await);
        assert!(store.is_done("C").await);
        assert!(!store.is_done("B").await);
    }

    #[tokio::test]
    async fn test_checkpoint_of_other_run_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.jsonl");
        FileCheckpointStore::open(&path, "run-1").await.unwrap();

        let err = FileCheckpointStore::open(&path, "run-2").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("checkpoint.jsonl");
        let store = FileCheckpointStore::open(&path, "run-1").await.unwrap();
        store
            .mark_done(CheckpointEntry::fetched("A", 0, DetailRecord::default()))
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(!path.exists());
        assert!(store.list_done().await.is_empty());
        assert!(store.mark_done(CheckpointEntry::unavailable("B", 1, "x")).await.is_err());
    }
}
