//! Durable attendee store
//!
//! The store holds the three relations owned by the Merger: attendee rows,
//! run rows and append-only change rows. [`AttendeeStore`] is the only write
//! path; every backend applies a [`MergePlan`](crate::merger::MergePlan)
//! atomically so a failed merge leaves no attendee pointing at an unfinished run.

pub mod backends;
pub mod config;
pub mod error;
pub mod lock;

pub use backends::{FileStore, MemoryStore};
#[cfg(feature = "postgres")]
pub use backends::PostgresStore;
pub use config::{BackendType, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use lock::{StoreLock, StoreLockGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::merger::MergePlan;
use crate::model::{AttendeeChange, NewRun, RunRecord, StoreStatistics, StoredAttendee};

/// Persistent store for attendees, runs and change history
#[async_trait]
pub trait AttendeeStore: Send + Sync {
    /// Prepare for writing once the caller holds the store's writer lock
    ///
    /// Backends that cache state reload it here; a shared database takes its
    /// own writer lock so hosts with separate lock files still exclude each
    /// other.
    async fn begin_write_session(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Counterpart of [`begin_write_session`](Self::begin_write_session)
    async fn end_write_session(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Get or create the run row for `run.run_timestamp` and mark it `partial`
    async fn register_run(&self, run: &NewRun) -> StorageResult<RunRecord>;

    /// Load stored rows for the given ids; missing ids are simply absent
    async fn load_attendees(&self, ids: &[String]) -> StorageResult<HashMap<String, StoredAttendee>>;

    /// Map each of the given emails that is already stored to its holder's id
    async fn email_owners(&self, emails: &[String]) -> StorageResult<HashMap<String, String>>;

    /// Apply a merge plan and finalize its run `completed`, all or nothing
    async fn commit_merge(&self, plan: &MergePlan) -> StorageResult<RunRecord>;

    /// Finalize a run `failed` with an error message
    async fn fail_run(&self, run_id: i64, error: &str) -> StorageResult<RunRecord>;

    async fn get_attendee(&self, id: &str) -> StorageResult<Option<StoredAttendee>>;

    async fn get_run(&self, run_id: i64) -> StorageResult<Option<RunRecord>>;

    async fn latest_completed_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Change history of one attendee, oldest first
    async fn changes_for_attendee(&self, attendee_id: &str) -> StorageResult<Vec<AttendeeChange>>;

    async fn changes_for_run(&self, run_id: i64) -> StorageResult<Vec<AttendeeChange>>;

    /// Attendees first seen in the given run
    async fn new_attendees_in_run(&self, run_id: i64) -> StorageResult<Vec<StoredAttendee>>;

    async fn statistics(&self) -> StorageResult<StoreStatistics>;

    /// Delete change rows older than `cutoff`; returns the number removed
    async fn purge_changes_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

/// Open the store selected by the configuration
pub async fn open_store(config: &StorageConfig) -> StorageResult<Arc<dyn AttendeeStore>> {
    info!(backend = ?config.backend, "Opening attendee store");
    match config.backend {
        BackendType::Memory => Ok(Arc::new(MemoryStore::new())),
        BackendType::File => Ok(Arc::new(FileStore::open(config.store_file()).await?)),
        #[cfg(feature = "postgres")]
        BackendType::Postgres => Ok(Arc::new(PostgresStore::connect(config).await?)),
        #[cfg(not(feature = "postgres"))]
        BackendType::Postgres => Err(StorageError::configuration(
            "PostgreSQL backend not enabled. Enable with --features postgres",
        )),
    }
}
