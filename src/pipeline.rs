//! Run orchestration: Lister → Enricher → Merger
//!
//! Each stage's complete output is written to the run directory before the
//! next stage starts, so a run can be resumed from whichever artifact
//! survived. The store's writer lock is held for the whole run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::AttendeeApi;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::SyncConfig;
use crate::enricher::Enricher;
use crate::error::{SyncError, SyncResult};
use crate::lister::Lister;
use crate::merger::Merger;
use crate::model::{RunRecord, StoreStatistics};
use crate::run::{RunCounts, RunDirectory, RunManifest, RunState, RunWorkspace, TransitionError};
use crate::signals::ShutdownSignal;
use crate::storage::{AttendeeStore, StorageConfig, StoreLockGuard};

/// Final state of one pipeline invocation
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_name: String,
    pub state: RunState,
    pub counts: RunCounts,
    pub store_run: Option<RunRecord>,
    pub integrity_violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub latest_run: Option<String>,
    pub latest_completed: Option<RunRecord>,
    pub statistics: StoreStatistics,
    pub resumable: Vec<RunManifest>,
}

pub struct Pipeline {
    config: SyncConfig,
    api: Arc<dyn AttendeeApi>,
    store: Arc<dyn AttendeeStore>,
    workspace: RunWorkspace,
    shutdown: ShutdownSignal,
}

impl Pipeline {
    pub fn new(
        config: SyncConfig,
        api: Arc<dyn AttendeeApi>,
        store: Arc<dyn AttendeeStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let workspace = RunWorkspace::new(config.storage.runs_dir());
        Self {
            config,
            api,
            store,
            workspace,
            shutdown,
        }
    }

    pub fn workspace(&self) -> &RunWorkspace {
        &self.workspace
    }

    /// Start a new run
    pub async fn run(&self) -> SyncResult<RunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Start a new run stamped `started_at`
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> SyncResult<RunSummary> {
        let lock = acquire_lock(&self.config.storage, self.store.as_ref()).await?;
        let result = match self.workspace.create_run(started_at).await {
            Ok(run) => self.execute(&lock, run).await,
            Err(e) => Err(e.into()),
        };
        release(lock, self.store.as_ref()).await;
        result
    }

    /// Continue the named run, or the newest resumable one
    pub async fn resume(&self, name: Option<&str>) -> SyncResult<RunSummary> {
        let lock = acquire_lock(&self.config.storage, self.store.as_ref()).await?;
        let result = self.resume_locked(&lock, name).await;
        release(lock, self.store.as_ref()).await;
        result
    }

    async fn resume_locked(&self, lock: &StoreLockGuard, name: Option<&str>) -> SyncResult<RunSummary> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self
                .workspace
                .find_resumable()
                .await?
                .map(|m| m.name)
                .ok_or_else(|| SyncError::RunNotFound {
                    name: "no resumable run".to_string(),
                })?,
        };

        let run = self.workspace.open_run(&name).await.map_err(|e| {
            if e.is_not_found() {
                SyncError::RunNotFound { name: name.clone() }
            } else {
                e.into()
            }
        })?;
        info!(run = %name, state = %run.state(), "Resuming run");

        if run.state().is_terminal() {
            return Err(TransitionError::Invalid {
                from: run.state(),
                to: RunState::Enriching,
            }
            .into());
        }

        if run.state() != RunState::Started && run.read_roster().await?.is_none() {
            let counts = run.manifest().counts.clone();
            run.discard().await?;
            return Ok(RunSummary {
                run_name: name,
                state: RunState::Discarded,
                counts,
                store_run: None,
                integrity_violations: 0,
            });
        }

        self.execute(lock, run).await
    }

    async fn execute(&self, lock: &StoreLockGuard, mut run: RunDirectory) -> SyncResult<RunSummary> {
        match self.advance_phases(lock, &mut run).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.handle_failure(lock, run, &err).await;
                Err(err)
            }
        }
    }

    async fn advance_phases(
        &self,
        lock: &StoreLockGuard,
        run: &mut RunDirectory,
    ) -> SyncResult<RunSummary> {
        let roster = match run.read_roster().await? {
            Some(roster) => roster,
            None => {
                run.advance(RunState::Listing).await?;
                let lister = Lister::new(
                    Arc::clone(&self.api),
                    self.config.lister.clone(),
                    self.shutdown.clone(),
                );
                let roster = lister.list().await?;
                run.write_roster(&roster).await?;
                run.manifest_mut().counts.roster = roster.attendees.len();
                run.save_manifest().await?;
                roster
            }
        };

        let enriched = match run.read_enriched().await? {
            Some(enriched) => enriched,
            None => {
                run.advance(RunState::Enriching).await?;
                let checkpoint =
                    Arc::new(FileCheckpointStore::open(run.checkpoint_path(), run.name()).await?);
                let enricher = Enricher::new(
                    Arc::clone(&self.api),
                    self.config.enricher.clone(),
                    self.shutdown.clone(),
                );
                let enriched = enricher
                    .enrich(roster.attendees.clone(), checkpoint.clone())
                    .await?;
                run.write_enriched(&enriched.attendees).await?;
                checkpoint.clear().await?;

                let counts = &mut run.manifest_mut().counts;
                counts.fetched = enriched.report.fetched;
                counts.detail_unavailable = enriched.report.unavailable;
                enriched.attendees
            }
        };

        if run.state() != RunState::Merging {
            run.advance(RunState::Merging).await?;
        }
        let merger = Merger::new(Arc::clone(&self.store), self.config.merger.clone());
        let outcome = merger
            .merge(
                lock,
                run.manifest().run_timestamp,
                &enriched,
                json!({
                    "run_directory": run.name(),
                    "reported_total": roster.total_reported,
                    "pages": roster.pages,
                }),
            )
            .await?;

        let manifest = run.manifest_mut();
        manifest.store_run_id = Some(outcome.run.id);
        manifest.counts.new_attendees = outcome.counts.new;
        manifest.counts.updated_attendees = outcome.counts.updated;
        manifest.error = None;
        run.advance(RunState::Completed).await?;
        self.workspace.mark_latest(run.name()).await?;

        info!(
            run = %run.name(),
            new = outcome.counts.new,
            updated = outcome.counts.updated,
            "Run completed"
        );
        Ok(RunSummary {
            run_name: run.name().to_string(),
            state: RunState::Completed,
            counts: run.manifest().counts.clone(),
            store_run: Some(outcome.run),
            integrity_violations: outcome.violations.len(),
        })
    }

    /// Leave the run in a state a later invocation can act on
    async fn handle_failure(&self, lock: &StoreLockGuard, mut run: RunDirectory, err: &SyncError) {
        let has_roster = matches!(run.read_roster().await, Ok(Some(_)));

        if err.is_interrupted() && !has_roster {
            if let Err(e) = run.discard().await {
                warn!("Could not discard interrupted run: {}", e);
            }
            return;
        }

        let merging = run.state() == RunState::Merging;
        let message = if err.is_interrupted() {
            "interrupted".to_string()
        } else {
            err.to_string()
        };
        if let Err(e) = run.fail(message.clone()).await {
            warn!(run = %run.name(), "Could not record run failure: {}", e);
        }
        warn!(run = %run.name(), checkpoint_retained = has_roster, "Run failed: {}", message);

        // The Merger finalizes its own run row
        if !merging {
            let merger = Merger::new(Arc::clone(&self.store), self.config.merger.clone());
            if let Err(e) = merger
                .record_failure(
                    lock,
                    run.manifest().run_timestamp,
                    run.manifest().counts.roster as u64,
                    &message,
                    json!({ "run_directory": run.name() }),
                )
                .await
            {
                warn!(run = %run.name(), "Could not record failed run in store: {}", e);
            }
        }
    }
}

/// Latest run pointer, store statistics and runs that can still be resumed
pub async fn status(
    workspace: &RunWorkspace,
    store: &dyn AttendeeStore,
) -> SyncResult<StatusReport> {
    let resumable = workspace
        .list()
        .await?
        .into_iter()
        .filter(|m| m.state.is_resumable())
        .collect();
    Ok(StatusReport {
        latest_run: workspace.latest().await?,
        latest_completed: store.latest_completed_run().await?,
        statistics: store.statistics().await?,
        resumable,
    })
}

/// Apply the change-record retention policy under the writer lock
pub async fn prune_changes(
    storage: &StorageConfig,
    store: &dyn AttendeeStore,
    cutoff: DateTime<Utc>,
) -> SyncResult<u64> {
    let lock = acquire_lock(storage, store).await?;
    let result = store.purge_changes_before(cutoff).await;
    release(lock, store).await;
    let removed = result?;
    info!(removed, cutoff = %cutoff, "Pruned change history");
    Ok(removed)
}

/// Take the writer lock, then open the store's write session under it
async fn acquire_lock(
    storage: &StorageConfig,
    store: &dyn AttendeeStore,
) -> SyncResult<StoreLockGuard> {
    let holder = format!("rostersync pid {}", std::process::id());
    let lock = StoreLockGuard::acquire(&storage.lock_file(), &holder, storage.lock_ttl).await?;
    if let Err(e) = store.begin_write_session().await {
        if let Err(release_err) = lock.release().await {
            warn!("Failed to release store lock: {}", release_err);
        }
        return Err(e.into());
    }
    Ok(lock)
}

async fn release(lock: StoreLockGuard, store: &dyn AttendeeStore) {
    if let Err(e) = store.end_write_session().await {
        warn!("Failed to end store write session: {}", e);
    }
    if let Err(e) = lock.release().await {
        warn!("Failed to release store lock: {}", e);
    }
}
