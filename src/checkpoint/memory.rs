//! In-memory checkpoint store for tests and ephemeral runs

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{summarize, CheckpointEntry, CheckpointStore, CheckpointSummary};
use crate::storage::StorageResult;

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    run_name: String,
    done: Mutex<HashMap<String, CheckpointEntry>>,
}

impl MemoryCheckpointStore {
    pub fn new(run_name: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            done: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn mark_done(&self, entry: CheckpointEntry) -> StorageResult<()> {
        self.done
            .lock()
            .await
            .insert(entry.attendee_id.clone(), entry);
        Ok(())
    }

    async fn is_done(&self, attendee_id: &str) -> bool {
        self.done.lock().await.contains_key(attendee_id)
    }

    async fn list_done(&self) -> HashMap<String, CheckpointEntry> {
        self.done.lock().await.clone()
    }

    async fn summary(&self) -> CheckpointSummary {
        summarize(&self.run_name, self.done.lock().await.values())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.done.lock().await.clear();
        Ok(())
    }
}
