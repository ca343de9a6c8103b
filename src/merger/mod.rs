//! Merger: the only writer to the attendee store
//!
//! A merge registers the run row, loads the stored rows the roster touches,
//! asks [`plan::build`] for the exact writes and change records, and hands the
//! plan to the store to commit atomically together with the `completed`
//! finalization. Any failure finalizes the run `failed` instead.

pub mod plan;

pub use plan::{
    EmailConflictPolicy, IntegrityViolation, MergeCounts, MergePlan, PendingChange, PlannedWrite,
    WriteKind,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::{AttendeeRecord, NewRun, RunRecord};
use crate::run::state::RunPhase;
use crate::storage::{AttendeeStore, StorageError, StoreLockGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub email_conflict_policy: EmailConflictPolicy,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub run: RunRecord,
    pub counts: MergeCounts,
    pub changes: usize,
    pub violations: Vec<IntegrityViolation>,
}

pub struct Merger {
    store: Arc<dyn AttendeeStore>,
    config: MergerConfig,
}

impl Merger {
    pub fn new(store: Arc<dyn AttendeeStore>, config: MergerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn AttendeeStore> {
        &self.store
    }

    /// Upsert an enriched roster and finalize its run
    ///
    /// The lock guard proves the caller holds exclusive write access to the
    /// store. It is checked before the run row is registered and again before
    /// the plan is committed.
    pub async fn merge(
        &self,
        lock: &StoreLockGuard,
        run_timestamp: DateTime<Utc>,
        roster: &[AttendeeRecord],
        metadata: Value,
    ) -> SyncResult<MergeOutcome> {
        ensure_lock_held(lock).await?;
        let run = self
            .store
            .register_run(&NewRun {
                run_timestamp,
                total_attendees: roster.len() as u64,
                metadata,
            })
            .await
            .map_err(|e| SyncError::partial(RunPhase::Merging, e.to_string(), false))?;
        info!(run_id = run.id, attendees = roster.len(), "Merging roster");

        match self.apply(lock, &run, roster).await {
            Ok(outcome) => {
                info!(
                    run_id = outcome.run.id,
                    new = outcome.counts.new,
                    updated = outcome.counts.updated,
                    unchanged = outcome.counts.unchanged,
                    detail_unavailable = outcome.counts.detail_unavailable,
                    changes = outcome.changes,
                    "Merge committed"
                );
                self.log_statistics().await;
                Ok(outcome)
            }
            Err(err) => {
                error!(run_id = run.id, "Merge failed: {}", err);
                if !lock.is_valid().await {
                    return Err(err);
                }
                if let Err(e) = self.store.fail_run(run.id, &err.to_string()).await {
                    error!(run_id = run.id, "Could not mark run failed: {}", e);
                }
                Err(match err {
                    SyncError::DataIntegrityViolation { .. } => err,
                    other => SyncError::partial(RunPhase::Merging, other.to_string(), false),
                })
            }
        }
    }

    async fn apply(
        &self,
        lock: &StoreLockGuard,
        run: &RunRecord,
        roster: &[AttendeeRecord],
    ) -> SyncResult<MergeOutcome> {
        let ids: Vec<String> = roster.iter().map(|r| r.id.clone()).collect();
        let mut stored = self.store.load_attendees(&ids).await?;

        let desired = plan::desired_emails(roster, &stored);
        let owners = self.store.email_owners(&desired).await?;
        let holders: Vec<String> = owners
            .values()
            .filter(|id| !stored.contains_key(*id))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if !holders.is_empty() {
            stored.extend(self.store.load_attendees(&holders).await?);
        }

        let plan = plan::build(
            run,
            roster,
            &stored,
            &owners,
            self.config.email_conflict_policy,
        )?;
        if !plan.violations.is_empty() {
            warn!(
                run_id = run.id,
                violations = plan.violations.len(),
                "Run has email conflicts flagged for review"
            );
        }

        ensure_lock_held(lock).await?;
        let committed = self.store.commit_merge(&plan).await?;
        Ok(MergeOutcome {
            run: committed,
            counts: plan.counts,
            changes: plan.changes.len(),
            violations: plan.violations,
        })
    }

    /// Record a run that failed before reaching the merge
    pub async fn record_failure(
        &self,
        lock: &StoreLockGuard,
        run_timestamp: DateTime<Utc>,
        total_attendees: u64,
        error: &str,
        metadata: Value,
    ) -> SyncResult<RunRecord> {
        ensure_lock_held(lock).await?;
        let run = self
            .store
            .register_run(&NewRun {
                run_timestamp,
                total_attendees,
                metadata,
            })
            .await?;
        let failed = self.store.fail_run(run.id, error).await?;
        info!(run_id = failed.id, "Recorded failed run");
        Ok(failed)
    }

    async fn log_statistics(&self) {
        match self.store.statistics().await {
            Ok(stats) => info!(
                attendees = stats.total_attendees,
                organizations = stats.unique_organizations,
                countries = stats.unique_countries,
                industries = stats.unique_industries,
                detail_unavailable = stats.detail_unavailable,
                runs = stats.total_runs,
                changes = stats.total_changes,
                "Store statistics"
            ),
            Err(e) => warn!("Could not compute store statistics: {}", e),
        }
    }
}

async fn ensure_lock_held(lock: &StoreLockGuard) -> SyncResult<()> {
    if lock.is_valid().await {
        Ok(())
    } else {
        Err(StorageError::lock(format!(
            "writer lock of {} is no longer held",
            lock.lock_info().holder
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendeeProfile, DetailRecord, RunStatus};
    use crate::storage::{MemoryStore, StoreLock};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn attendee(id: &str, title: &str, email: &str) -> AttendeeRecord {
        let mut record = AttendeeRecord::shell(
            id,
            AttendeeProfile {
                first_name: Some(id.to_string()),
                job_title: Some(title.to_string()),
                ..Default::default()
            },
            json!({ "id": id }),
        );
        record.apply_detail(&DetailRecord {
            email: Some(email.to_string()),
            ..Default::default()
        });
        record
    }

    fn take_over(temp: &TempDir) {
        let other = StoreLock::new("other-run".into(), Duration::from_secs(60));
        std::fs::write(temp.path().join("store.lock"), serde_json::to_vec(&other).unwrap())
            .unwrap();
    }

    async fn guard(temp: &TempDir) -> StoreLockGuard {
        StoreLockGuard::acquire(&temp.path().join("store.lock"), "test", Duration::from_secs(60))
            .await
            .unwrap()
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_merge_then_remerge_is_noop() {
        let temp = TempDir::new().unwrap();
        let lock = guard(&temp).await;
        let store = Arc::new(MemoryStore::new());
        let merger = Merger::new(store.clone(), MergerConfig::default());
        let roster = vec![
            attendee("A", "CEO", "a@example.com"),
            attendee("B", "CTO", "b@example.com"),
        ];

        let first = merger.merge(&lock, ts(1), &roster, Value::Null).await.unwrap();
        assert_eq!(first.counts.new, 2);
        assert_eq!(first.run.status, RunStatus::Completed);

        let second = merger.merge(&lock, ts(2), &roster, Value::Null).await.unwrap();
        assert_eq!(second.counts.new, 0);
        assert_eq!(second.counts.updated, 0);
        assert_eq!(second.changes, 0);
        let a = store.get_attendee("A").await.unwrap().unwrap();
        assert_eq!(a.last_seen_run_id, second.run.id);
    }

    #[tokio::test]
    async fn test_flagged_conflict_is_recorded_in_run_metadata() {
        let temp = TempDir::new().unwrap();
        let lock = guard(&temp).await;
        let store = Arc::new(MemoryStore::new());
        let merger = Merger::new(store.clone(), MergerConfig::default());

        merger
            .merge(&lock, ts(1), &[attendee("A", "CEO", "shared@example.com")], Value::Null)
            .await
            .unwrap();
        let outcome = merger
            .merge(
                &lock,
                ts(2),
                &[
                    attendee("A", "CEO", "shared@example.com"),
                    attendee("B", "CTO", "shared@example.com"),
                ],
                Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].kept_by, "A");
        let b = store.get_attendee("B").await.unwrap().unwrap();
        assert_eq!(b.email(), "noemail_B@placeholder.com");
        assert!(outcome.run.metadata["integrity_violations"].is_array());
    }

    #[tokio::test]
    async fn test_failed_commit_marks_run_failed() {
        let temp = TempDir::new().unwrap();
        let lock = guard(&temp).await;
        let store = Arc::new(MemoryStore::new());
        let merger = Merger::new(store.clone(), MergerConfig::default());

        let mut a = attendee("A", "CEO", "a@example.com");
        a.profile.user_id = Some("u1".into());
        let mut b = attendee("B", "CTO", "b@example.com");
        b.profile.user_id = Some("u1".into());

        let err = merger
            .merge(&lock, ts(1), &[a, b], Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::PartialRunFailure {
                phase: RunPhase::Merging,
                ..
            }
        ));

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_attendees, 0);
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.completed_runs, 0);
        assert!(store.latest_completed_run().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_failure_creates_failed_row() {
        let temp = TempDir::new().unwrap();
        let lock = guard(&temp).await;
        let store = Arc::new(MemoryStore::new());
        let merger = Merger::new(store.clone(), MergerConfig::default());

        let run = merger
            .record_failure(&lock, ts(1), 0, "listing failed", json!({"run": "x"}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("listing failed"));
        assert_eq!(run.new_attendees, 0);
    }

    #[tokio::test]
    async fn test_merge_refuses_without_held_lock() {
        let temp = TempDir::new().unwrap();
        let lock = guard(&temp).await;
        let store = Arc::new(MemoryStore::new());
        let merger = Merger::new(store.clone(), MergerConfig::default());
        take_over(&temp);

        let err = merger
            .merge(&lock, ts(1), &[attendee("A", "CEO", "a@example.com")], Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(StorageError::Lock(_))));
        let err = merger
            .record_failure(&lock, ts(1), 0, "listing failed", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(StorageError::Lock(_))));

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_runs, 0);
        assert_eq!(stats.total_attendees, 0);
    }
}
