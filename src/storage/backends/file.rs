//! File-based attendee store
//!
//! The whole store is a single JSON document rewritten atomically after every
//! mutation. Mutations are applied to a copy which only replaces the in-memory
//! state once the new document is on disk. Another process may have committed
//! since the store was opened, so a write session starts by reloading the
//! document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::memory::StoreState;
use super::{read_json, write_json_atomic};
use crate::merger::MergePlan;
use crate::model::{AttendeeChange, NewRun, RunRecord, StoreStatistics, StoredAttendee};
use crate::storage::error::StorageResult;
use crate::storage::AttendeeStore;

pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if it does not exist yet
    pub async fn open(path: PathBuf) -> StorageResult<Self> {
        let state = Self::load(&path).await?;
        info!(
            path = %path.display(),
            attendees = state.statistics().total_attendees,
            "Loaded attendee store"
        );
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    async fn load(path: &Path) -> StorageResult<StoreState> {
        if path.exists() {
            read_json(path).await
        } else {
            debug!(path = %path.display(), "Starting empty attendee store");
            Ok(StoreState::default())
        }
    }

    /// Replace the in-memory state with the document on disk
    pub async fn reload(&self) -> StorageResult<()> {
        let fresh = Self::load(&self.path).await?;
        *self.state.write().await = fresh;
        debug!(path = %self.path.display(), "Reloaded attendee store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against a copy of the state, persist it, then publish it
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> StorageResult<T> + Send,
    ) -> StorageResult<T> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        write_json_atomic(&self.path, &next).await?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl AttendeeStore for FileStore {
    async fn begin_write_session(&self) -> StorageResult<()> {
        self.reload().await
    }

    async fn register_run(&self, run: &NewRun) -> StorageResult<RunRecord> {
        self.mutate(|s| Ok(s.register_run(run))).await
    }

    async fn load_attendees(&self, ids: &[String]) -> StorageResult<HashMap<String, StoredAttendee>> {
        Ok(self.state.read().await.load_attendees(ids))
    }

    async fn email_owners(&self, emails: &[String]) -> StorageResult<HashMap<String, String>> {
        Ok(self.state.read().await.email_owners(emails))
    }

    async fn commit_merge(&self, plan: &MergePlan) -> StorageResult<RunRecord> {
        self.mutate(|s| s.apply_merge(plan)).await
    }

    async fn fail_run(&self, run_id: i64, error: &str) -> StorageResult<RunRecord> {
        self.mutate(|s| s.fail_run(run_id, error)).await
    }

    async fn get_attendee(&self, id: &str) -> StorageResult<Option<StoredAttendee>> {
        Ok(self.state.read().await.get_attendee(id))
    }

    async fn get_run(&self, run_id: i64) -> StorageResult<Option<RunRecord>> {
        Ok(self.state.read().await.get_run(run_id))
    }

    async fn latest_completed_run(&self) -> StorageResult<Option<RunRecord>> {
        Ok(self.state.read().await.latest_completed_run())
    }

    async fn changes_for_attendee(&self, attendee_id: &str) -> StorageResult<Vec<AttendeeChange>> {
        Ok(self.state.read().await.changes_for_attendee(attendee_id))
    }

    async fn changes_for_run(&self, run_id: i64) -> StorageResult<Vec<AttendeeChange>> {
        Ok(self.state.read().await.changes_for_run(run_id))
    }

    async fn new_attendees_in_run(&self, run_id: i64) -> StorageResult<Vec<StoredAttendee>> {
        Ok(self.state.read().await.new_attendees_in_run(run_id))
    }

    async fn statistics(&self) -> StorageResult<StoreStatistics> {
        Ok(self.state.read().await.statistics())
    }

    async fn purge_changes_before(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        self.mutate(|s| Ok(s.purge_changes_before(cutoff))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{MergeCounts, PendingChange, PlannedWrite, WriteKind};
    use crate::model::{AttendeeProfile, RunStatus};
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn new_run(ts: DateTime<Utc>) -> NewRun {
        NewRun {
            run_timestamp: ts,
            total_attendees: 0,
            metadata: json!({}),
        }
    }

    fn insert(id: &str, email: &str, run_id: i64, ts: DateTime<Utc>) -> PlannedWrite {
        PlannedWrite {
            kind: WriteKind::Insert,
            row: StoredAttendee {
                id: id.to_string(),
                profile: AttendeeProfile {
                    email: Some(email.to_string()),
                    ..Default::default()
                },
                detail_available: true,
                first_seen_at: ts,
                last_updated_at: ts,
                update_count: 0,
                last_seen_run_id: run_id,
                raw_data: Value::Null,
            },
        }
    }

    fn plan(run: &RunRecord, writes: Vec<PlannedWrite>, changes: Vec<PendingChange>) -> MergePlan {
        MergePlan {
            run_id: run.id,
            merged_at: run.run_timestamp,
            counts: MergeCounts {
                total: writes.len() as u64,
                new: writes.len() as u64,
                ..Default::default()
            },
            writes,
            changes,
            violations: Vec::new(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");

        let run = {
            let store = FileStore::open(path.clone()).await.unwrap();
            let run = store
                .register_run(&NewRun {
                    run_timestamp: Utc::now(),
                    total_attendees: 0,
                    metadata: json!({}),
                })
                .await
                .unwrap();
            store.fail_run(run.id, "interrupted").await.unwrap();
            run
        };

        let reopened = FileStore::open(path.clone()).await.unwrap();
        let loaded = reopened.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.error_message.as_deref(), Some("interrupted"));
        assert!(!temp.path().join("store.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::open(temp.path().join("nested/store.json"))
            .await
            .unwrap();
        assert_eq!(store.statistics().await.unwrap(), StoreStatistics::default());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let store = FileStore::open(path.clone()).await.unwrap();
        let ts = Utc::now();
        let run = store.register_run(&new_run(ts)).await.unwrap();
        let on_disk = std::fs::read(&path).unwrap();

        let writes = vec![
            insert("A", "same@x.io", run.id, ts),
            insert("B", "same@x.io", run.id, ts),
        ];
        let change = PendingChange {
            attendee_id: "A".into(),
            field_name: "job_title".into(),
            old_value: None,
            new_value: Some("CTO".into()),
        };
        let err = store
            .commit_merge(&plan(&run, writes, vec![change]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(std::fs::read(&path).unwrap(), on_disk);
        assert!(!temp.path().join("store.json.tmp").exists());
        assert!(store.get_attendee("A").await.unwrap().is_none());
        assert!(store.changes_for_run(run.id).await.unwrap().is_empty());
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Partial
        );

        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(reopened.statistics().await.unwrap().total_attendees, 0);
    }

    #[tokio::test]
    async fn test_write_session_sees_commits_from_other_handles() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let stale = FileStore::open(path.clone()).await.unwrap();
        let other = FileStore::open(path.clone()).await.unwrap();

        let ts = Utc::now();
        let first = other.register_run(&new_run(ts)).await.unwrap();
        other
            .commit_merge(&plan(&first, vec![insert("A", "a@x.io", first.id, ts)], vec![]))
            .await
            .unwrap();

        stale.begin_write_session().await.unwrap();
        assert!(stale.get_attendee("A").await.unwrap().is_some());
        let later = ts + chrono::Duration::seconds(1);
        let second = stale.register_run(&new_run(later)).await.unwrap();
        assert_ne!(second.id, first.id);
        stale
            .commit_merge(&plan(&second, vec![insert("B", "b@x.io", second.id, later)], vec![]))
            .await
            .unwrap();
        stale.end_write_session().await.unwrap();

        let reopened = FileStore::open(path).await.unwrap();
        let stats = reopened.statistics().await.unwrap();
        assert_eq!(stats.total_attendees, 2);
        assert_eq!(
            reopened.get_run(first.id).await.unwrap().unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(
            reopened.latest_completed_run().await.unwrap().unwrap().id,
            second.id
        );
    }
}
