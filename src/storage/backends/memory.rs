//! In-memory attendee store
//!
//! [`StoreState`] is also the persisted document of the file backend, so both
//! share the same merge semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use super::merge_metadata;
use crate::merger::{MergePlan, WriteKind};
use crate::model::{
    AttendeeChange, NewRun, RunRecord, RunStatus, StoreStatistics, StoredAttendee,
};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::AttendeeStore;

/// The complete contents of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    attendees: BTreeMap<String, StoredAttendee>,
    runs: BTreeMap<i64, RunRecord>,
    changes: Vec<AttendeeChange>,
    next_run_id: i64,
    next_change_id: i64,
}

impl StoreState {
    pub fn register_run(&mut self, run: &NewRun) -> RunRecord {
        if let Some(existing) = self
            .runs
            .values_mut()
            .find(|r| r.run_timestamp == run.run_timestamp)
        {
            existing.status = RunStatus::Partial;
            existing.error_message = None;
            existing.finished_at = None;
            existing.total_attendees = run.total_attendees;
            merge_metadata(&mut existing.metadata, &run.metadata);
            return existing.clone();
        }

        self.next_run_id += 1;
        let record = RunRecord {
            id: self.next_run_id,
            run_timestamp: run.run_timestamp,
            total_attendees: run.total_attendees,
            new_attendees: 0,
            updated_attendees: 0,
            status: RunStatus::Partial,
            error_message: None,
            metadata: run.metadata.clone(),
            finished_at: None,
        };
        self.runs.insert(record.id, record.clone());
        record
    }

    pub fn load_attendees(&self, ids: &[String]) -> HashMap<String, StoredAttendee> {
        ids.iter()
            .filter_map(|id| self.attendees.get(id).map(|a| (id.clone(), a.clone())))
            .collect()
    }

    pub fn email_owners(&self, emails: &[String]) -> HashMap<String, String> {
        let wanted: HashSet<&str> = emails.iter().map(String::as_str).collect();
        self.attendees
            .values()
            .filter(|a| wanted.contains(a.email()))
            .map(|a| (a.email().to_string(), a.id.clone()))
            .collect()
    }

    /// Apply a plan in place; callers discard the state on error
    pub fn apply_merge(&mut self, plan: &MergePlan) -> StorageResult<RunRecord> {
        match self.runs.get(&plan.run_id) {
            None => return Err(StorageError::not_found(format!("run {}", plan.run_id))),
            Some(run) if run.status != RunStatus::Partial => {
                return Err(StorageError::conflict(format!(
                    "run {} is {}, expected partial",
                    run.id, run.status
                )))
            }
            Some(_) => {}
        }

        for write in &plan.writes {
            if write.kind == WriteKind::Insert && self.attendees.contains_key(&write.row.id) {
                return Err(StorageError::conflict(format!(
                    "attendee {} already exists",
                    write.row.id
                )));
            }
            if write.row.email().is_empty() {
                return Err(StorageError::conflict(format!(
                    "attendee {} has no email",
                    write.row.id
                )));
            }
            self.attendees.insert(write.row.id.clone(), write.row.clone());
        }

        let mut emails: HashMap<&str, &str> = HashMap::with_capacity(self.attendees.len());
        let mut user_ids: HashMap<&str, &str> = HashMap::new();
        for attendee in self.attendees.values() {
            if let Some(other) = emails.insert(attendee.email(), attendee.id.as_str()) {
                return Err(StorageError::conflict(format!(
                    "duplicate email {} for {} and {}",
                    attendee.email(),
                    other,
                    attendee.id
                )));
            }
            if let Some(user_id) = attendee.profile.user_id.as_deref() {
                if let Some(other) = user_ids.insert(user_id, attendee.id.as_str()) {
                    return Err(StorageError::conflict(format!(
                        "duplicate user id {} for {} and {}",
                        user_id, other, attendee.id
                    )));
                }
            }
        }

        for change in &plan.changes {
            self.next_change_id += 1;
            self.changes.push(AttendeeChange {
                id: self.next_change_id,
                attendee_id: change.attendee_id.clone(),
                run_id: plan.run_id,
                field_name: change.field_name.clone(),
                old_value: change.old_value.clone(),
                new_value: change.new_value.clone(),
                changed_at: plan.merged_at,
            });
        }

        let run = self
            .runs
            .get_mut(&plan.run_id)
            .ok_or_else(|| StorageError::not_found(format!("run {}", plan.run_id)))?;
        run.total_attendees = plan.counts.total;
        run.new_attendees = plan.counts.new;
        run.updated_attendees = plan.counts.updated;
        run.status = RunStatus::Completed;
        run.error_message = None;
        run.finished_at = Some(Utc::now());
        merge_metadata(&mut run.metadata, &plan.metadata);
        Ok(run.clone())
    }

    pub fn fail_run(&mut self, run_id: i64, error: &str) -> StorageResult<RunRecord> {
        let run = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StorageError::not_found(format!("run {}", run_id)))?;
        run.status = RunStatus::Failed;
        run.error_message = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        Ok(run.clone())
    }

    pub fn get_attendee(&self, id: &str) -> Option<StoredAttendee> {
        self.attendees.get(id).cloned()
    }

    pub fn get_run(&self, run_id: i64) -> Option<RunRecord> {
        self.runs.get(&run_id).cloned()
    }

    pub fn latest_completed_run(&self) -> Option<RunRecord> {
        self.runs
            .values()
            .filter(|r| r.status == RunStatus::Completed)
            .max_by_key(|r| r.run_timestamp)
            .cloned()
    }

    pub fn changes_for_attendee(&self, attendee_id: &str) -> Vec<AttendeeChange> {
        self.changes
            .iter()
            .filter(|c| c.attendee_id == attendee_id)
            .cloned()
            .collect()
    }

    pub fn changes_for_run(&self, run_id: i64) -> Vec<AttendeeChange> {
        self.changes
            .iter()
            .filter(|c| c.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn new_attendees_in_run(&self, run_id: i64) -> Vec<StoredAttendee> {
        let Some(run) = self.runs.get(&run_id) else {
            return Vec::new();
        };
        self.attendees
            .values()
            .filter(|a| a.first_seen_at == run.run_timestamp)
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> StoreStatistics {
        fn distinct<'a>(values: impl Iterator<Item = Option<&'a str>>) -> u64 {
            values
                .flatten()
                .filter(|v| !v.trim().is_empty())
                .collect::<HashSet<_>>()
                .len() as u64
        }

        let attendees = || self.attendees.values();
        let latest = self.latest_completed_run();
        StoreStatistics {
            total_attendees: self.attendees.len() as u64,
            unique_organizations: distinct(attendees().map(|a| a.profile.organization.as_deref())),
            unique_countries: distinct(attendees().map(|a| a.profile.detail_country.as_deref())),
            unique_industries: distinct(attendees().map(|a| a.profile.detail_industry.as_deref())),
            detail_unavailable: attendees().filter(|a| !a.detail_available).count() as u64,
            total_runs: self.runs.len() as u64,
            completed_runs: self
                .runs
                .values()
                .filter(|r| r.status == RunStatus::Completed)
                .count() as u64,
            total_changes: self.changes.len() as u64,
            latest_completed_run: latest.map(|r| r.run_timestamp),
        }
    }

    pub fn purge_changes_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let before = self.changes.len();
        self.changes.retain(|c| c.changed_at >= cutoff);
        (before - self.changes.len()) as u64
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Snapshot of the whole store
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl AttendeeStore for MemoryStore {
    async fn register_run(&self, run: &NewRun) -> StorageResult<RunRecord> {
        Ok(self.state.write().await.register_run(run))
    }

    async fn load_attendees(&self, ids: &[String]) -> StorageResult<HashMap<String, StoredAttendee>> {
        Ok(self.state.read().await.load_attendees(ids))
    }

    async fn email_owners(&self, emails: &[String]) -> StorageResult<HashMap<String, String>> {
        Ok(self.state.read().await.email_owners(emails))
    }

    async fn commit_merge(&self, plan: &MergePlan) -> StorageResult<RunRecord> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let run = next.apply_merge(plan)?;
        *state = next;
        debug!(run_id = run.id, writes = plan.writes.len(), "Committed merge");
        Ok(run)
    }

    async fn fail_run(&self, run_id: i64, error: &str) -> StorageResult<RunRecord> {
        self.state.write().await.fail_run(run_id, error)
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
        Ok(self.state.write().await.purge_changes_before(cutoff))
    }
}
