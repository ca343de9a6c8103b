//! Enricher progress checkpoints
//!
//! A checkpoint is the durable set of attendees whose enrichment finished in a
//! run, together with the outcome. Workers append concurrently; a fresh process
//! reads it back to skip completed ids on resume.

pub mod file;
pub mod memory;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::DetailRecord;
use crate::storage::StorageResult;

/// Result of enriching one attendee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckpointOutcome {
    Fetched { detail: DetailRecord },
    Unavailable { reason: String },
}

/// One completed roster item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub attendee_id: String,
    /// Position of the attendee in the roster
    pub index: usize,
    #[serde(flatten)]
    pub outcome: CheckpointOutcome,
    pub completed_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn fetched(attendee_id: impl Into<String>, index: usize, detail: DetailRecord) -> Self {
        Self {
            attendee_id: attendee_id.into(),
            index,
            outcome: CheckpointOutcome::Fetched { detail },
            completed_at: Utc::now(),
        }
    }

    pub fn unavailable(attendee_id: impl Into<String>, index: usize, reason: impl Into<String>) -> Self {
        Self {
            attendee_id: attendee_id.into(),
            index,
            outcome: CheckpointOutcome::Unavailable {
                reason: reason.into(),
            },
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub run_name: String,
    pub completed: usize,
    pub unavailable: usize,
    /// Highest roster index completed so far
    pub last_index: Option<usize>,
}

/// Run-scoped durable set of completed enrichment items
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Durably record a completed item; safe to call from many workers at once
    async fn mark_done(&self, entry: CheckpointEntry) -> StorageResult<()>;

    async fn is_done(&self, attendee_id: &str) -> bool;

    async fn list_done(&self) -> HashMap<String, CheckpointEntry>;

    async fn summary(&self) -> CheckpointSummary;

    /// Drop the checkpoint once the phase it tracks has completed
    async fn clear(&self) -> StorageResult<()>;
}

pub(crate) fn summarize<'a>(
    run_name: &str,
    entries: impl Iterator<Item = &'a CheckpointEntry>,
) -> CheckpointSummary {
    let mut summary = CheckpointSummary {
        run_name: run_name.to_string(),
        ..Default::default()
    };
    for entry in entries {
        summary.completed += 1;
        if matches!(entry.outcome, CheckpointOutcome::Unavailable { .. }) {
            summary.unavailable += 1;
        }
        summary.last_index = summary.last_index.max(Some(entry.index));
    }
    summary
}
