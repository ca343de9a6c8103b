//! Run workspace on disk
//!
//! Each run owns `<runs>/<YYYY-MM-DD_HHMMSS>/` holding its manifest, the roster
//! and enriched snapshots and the enrichment checkpoint. `<runs>/LATEST` names
//! the newest completed run and is only ever replaced atomically.

pub mod state;

pub use state::{transition, RunPhase, RunState, TransitionError};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::lister::Roster;
use crate::model::AttendeeRecord;
use crate::storage::backends::{read_json, write_atomic, write_json_atomic};
use crate::storage::{StorageError, StorageResult};

pub const RUN_NAME_FORMAT: &str = "%Y-%m-%d_%H%M%S";

const MANIFEST_FILE: &str = "run.json";
const ROSTER_FILE: &str = "roster.json";
const ENRICHED_FILE: &str = "enriched.json";
const CHECKPOINT_FILE: &str = "checkpoint.jsonl";
const LATEST_FILE: &str = "LATEST";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub roster: usize,
    pub fetched: usize,
    pub detail_unavailable: usize,
    pub new_attendees: u64,
    pub updated_attendees: u64,
}

/// `run.json`: lifecycle record of one run directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub name: String,
    pub run_timestamp: DateTime<Utc>,
    pub state: RunState,
    #[serde(default)]
    pub history: Vec<StateChange>,
    #[serde(default)]
    pub counts: RunCounts,
    /// Id of the run row in the attendee store once registered
    #[serde(default)]
    pub store_run_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn new(name: impl Into<String>, run_timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            run_timestamp,
            state: RunState::Started,
            history: vec![StateChange {
                state: RunState::Started,
                at: Utc::now(),
            }],
            counts: RunCounts::default(),
            store_run_id: None,
            error: None,
        }
    }

    /// Move to `to` if the state machine allows it
    pub fn advance(&mut self, to: RunState) -> Result<(), TransitionError> {
        self.state = transition(self.state, to)?;
        self.history.push(StateChange {
            state: to,
            at: Utc::now(),
        });
        Ok(())
    }
}

/// Root directory holding every run of one store
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory and manifest of a new run started at `now`
    pub async fn create_run(&self, now: DateTime<Utc>) -> StorageResult<RunDirectory> {
        let run_timestamp = now.trunc_subsecs(0);
        let name = run_timestamp.format(RUN_NAME_FORMAT).to_string();
        let path = self.root.join(&name);
        if fs::try_exists(&path).await? {
            return Err(StorageError::conflict(format!("run {} already exists", name)));
        }
        fs::create_dir_all(&path).await?;

        let run = RunDirectory {
            path,
            manifest: RunManifest::new(name, run_timestamp),
        };
        run.save_manifest().await?;
        info!(run = %run.name(), "Created run directory");
        Ok(run)
    }

    pub async fn open_run(&self, name: &str) -> StorageResult<RunDirectory> {
        let path = self.root.join(name);
        let manifest_path = path.join(MANIFEST_FILE);
        if !fs::try_exists(&manifest_path).await? {
            return Err(StorageError::not_found(format!("run {}", name)));
        }
        let manifest = read_json(&manifest_path).await?;
        Ok(RunDirectory { path, manifest })
    }

    /// Manifests of every run, oldest first
    pub async fn list(&self) -> StorageResult<Vec<RunManifest>> {
        let mut manifests = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            match read_json::<RunManifest>(&manifest_path).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(
                    path = %entry.path().display(),
                    "Ignoring directory without readable run manifest: {}", e
                ),
            }
        }

        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(manifests)
    }

    /// Newest run that a later invocation may continue
    pub async fn find_resumable(&self) -> StorageResult<Option<RunManifest>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .rev()
            .find(|m| m.state.is_resumable()))
    }

    /// Point LATEST at a completed run
    pub async fn mark_latest(&self, run_name: &str) -> StorageResult<()> {
        write_atomic(&self.root.join(LATEST_FILE), format!("{}\n", run_name).as_bytes()).await?;
        debug!(run = run_name, "Updated latest run pointer");
        Ok(())
    }

    pub async fn latest(&self) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.root.join(LATEST_FILE)).await {
            Ok(content) => {
                let name = content.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// One run's directory and manifest
#[derive(Debug)]
pub struct RunDirectory {
    path: PathBuf,
    manifest: RunManifest,
}

impl RunDirectory {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn manifest_mut(&mut self) -> &mut RunManifest {
        &mut self.manifest
    }

    pub fn state(&self) -> RunState {
        self.manifest.state
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.path.join(CHECKPOINT_FILE)
    }

    pub async fn save_manifest(&self) -> StorageResult<()> {
        write_json_atomic(&self.path.join(MANIFEST_FILE), &self.manifest).await
    }

    /// Record a state transition durably
    pub async fn advance(&mut self, to: RunState) -> SyncResult<()> {
        self.manifest.advance(to)?;
        self.save_manifest().await?;
        debug!(run = %self.name(), state = %to, "Run state changed");
        Ok(())
    }

    /// Finalize the run `failed`, keeping every artifact for resume
    pub async fn fail(&mut self, error: impl Into<String>) -> SyncResult<()> {
        self.manifest.error = Some(error.into());
        if self.manifest.state != RunState::Failed {
            self.manifest.advance(RunState::Failed)?;
        }
        self.save_manifest().await?;
        Ok(())
    }

    pub async fn write_roster(&self, roster: &Roster) -> StorageResult<()> {
        write_json_atomic(&self.path.join(ROSTER_FILE), roster).await
    }

    pub async fn read_roster(&self) -> StorageResult<Option<Roster>> {
        read_optional(&self.path.join(ROSTER_FILE)).await
    }

    pub async fn write_enriched(&self, attendees: &[AttendeeRecord]) -> StorageResult<()> {
        write_json_atomic(&self.path.join(ENRICHED_FILE), &attendees).await
    }

    pub async fn read_enriched(&self) -> StorageResult<Option<Vec<AttendeeRecord>>> {
        read_optional(&self.path.join(ENRICHED_FILE)).await
    }

    /// Remove a run that never produced usable data
    pub async fn discard(mut self) -> SyncResult<()> {
        self.manifest.advance(RunState::Discarded)?;
        fs::remove_dir_all(&self.path)
            .await
            .map_err(StorageError::from)?;
        info!(run = %self.name(), "Discarded run without roster");
        Ok(())
    }
}

async fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    Ok(Some(read_json(path).await?))
}
