//! Concurrent, rate-limited detail enrichment
//!
//! A fixed pool of workers drains a shared queue of roster items. Every
//! request, retries included, passes the shared [`RateLimiter`] first. Each
//! finished item is appended to the run's checkpoint before the worker takes
//! the next one, so a restarted run only queues what is missing.
//!
//! The checkpoint is left in place when [`Enricher::enrich`] returns; the
//! caller clears it once the enriched snapshot is durable.

pub mod rate_limiter;

pub use rate_limiter::{RateLimit, RateLimiter};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, AttendeeApi};
use crate::checkpoint::{CheckpointEntry, CheckpointOutcome, CheckpointStore};
use crate::error::{SyncError, SyncResult};
use crate::model::AttendeeRecord;
use crate::retry::{RetryConfig, RetryExecutor, RetryFailure};
use crate::run::state::RunPhase;
use crate::signals::ShutdownSignal;

const PROGRESS_INTERVAL: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnricherConfig {
    /// Size of the worker pool
    pub workers: usize,
    /// Aggregate request budget across all workers
    pub rate_limit: RateLimit,
    /// Per-item retry policy
    pub retry: RetryConfig,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            rate_limit: RateLimit::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub total: usize,
    pub fetched: usize,
    pub unavailable: usize,
    /// Items already present in the checkpoint when the phase started
    pub resumed: usize,
}

#[derive(Debug)]
pub struct Enriched {
    pub attendees: Vec<AttendeeRecord>,
    pub report: EnrichmentReport,
}

pub struct Enricher {
    api: Arc<dyn AttendeeApi>,
    config: EnricherConfig,
    limiter: Arc<RateLimiter>,
    shutdown: ShutdownSignal,
}

/// State shared by the worker pool
struct WorkerShared {
    api: Arc<dyn AttendeeApi>,
    limiter: Arc<RateLimiter>,
    checkpoint: Arc<dyn CheckpointStore>,
    queue: Mutex<VecDeque<(usize, String)>>,
    abort: AtomicBool,
    completed: AtomicUsize,
    total: usize,
}

impl Enricher {
    pub fn new(api: Arc<dyn AttendeeApi>, config: EnricherConfig, shutdown: ShutdownSignal) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            api,
            config,
            limiter,
            shutdown,
        }
    }

    /// Enrich every roster entry, skipping ids already in `checkpoint`
    pub async fn enrich(
        &self,
        mut roster: Vec<AttendeeRecord>,
        checkpoint: Arc<dyn CheckpointStore>,
    ) -> SyncResult<Enriched> {
        let done = checkpoint.list_done().await;
        let mut seen = HashSet::new();
        let queue: VecDeque<(usize, String)> = roster
            .iter()
            .enumerate()
            .filter(|(_, record)| !done.contains_key(&record.id))
            .filter(|(_, record)| seen.insert(record.id.clone()))
            .map(|(index, record)| (index, record.id.clone()))
            .collect();

        let resumed = roster.iter().filter(|r| done.contains_key(&r.id)).count();
        let workers = self.config.workers.max(1).min(queue.len().max(1));
        info!(
            total = roster.len(),
            queued = queue.len(),
            resumed,
            workers,
            "Starting enrichment"
        );

        let shared = Arc::new(WorkerShared {
            api: Arc::clone(&self.api),
            limiter: Arc::clone(&self.limiter),
            checkpoint: Arc::clone(&checkpoint),
            total: queue.len(),
            queue: Mutex::new(queue),
            abort: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        });

        let mut handles: FuturesUnordered<JoinHandle<SyncResult<()>>> = (0..workers)
            .map(|worker| {
                let shared = Arc::clone(&shared);
                let retry = RetryExecutor::new(self.config.retry.clone());
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move { run_worker(worker, shared, retry, shutdown).await })
            })
            .collect();

        let interrupted = SyncError::Interrupted {
            phase: RunPhase::Enriching,
        };
        let drained = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(interrupted),
            result = drain(&mut handles) => match result {
                Ok(()) if self.shutdown.is_shutdown_requested() => Err(interrupted),
                other => other,
            },
        };
        if let Err(err) = drained {
            shared.abort.store(true, Ordering::Release);
            for handle in handles.iter() {
                handle.abort();
            }
            warn!("Enrichment aborted, checkpoint retained: {}", err);
            return Err(err);
        }

        let done = checkpoint.list_done().await;
        let mut report = EnrichmentReport {
            total: roster.len(),
            resumed,
            ..Default::default()
        };
        for record in roster.iter_mut() {
            match done.get(&record.id).map(|entry| &entry.outcome) {
                Some(CheckpointOutcome::Fetched { detail }) => {
                    record.apply_detail(detail);
                    report.fetched += 1;
                }
                Some(CheckpointOutcome::Unavailable { reason }) => {
                    record.mark_unavailable(reason.clone());
                    report.unavailable += 1;
                }
                None => {
                    return Err(SyncError::partial(
                        RunPhase::Enriching,
                        format!("attendee {} missing from checkpoint", record.id),
                        true,
                    ))
                }
            }
        }

        info!(
            fetched = report.fetched,
            unavailable = report.unavailable,
            resumed = report.resumed,
            "Enrichment complete"
        );
        Ok(Enriched {
            attendees: roster,
            report,
        })
    }
}

/// Wait for every worker; the first failure wins
async fn drain(handles: &mut FuturesUnordered<JoinHandle<SyncResult<()>>>) -> SyncResult<()> {
    while let Some(joined) = handles.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(e) => {
                error!("Enrichment worker panicked: {}", e);
                return Err(SyncError::partial(
                    RunPhase::Enriching,
                    format!("worker failed: {}", e),
                    true,
                ));
            }
        }
    }
    Ok(())
}

async fn run_worker(
    worker: usize,
    shared: Arc<WorkerShared>,
    retry: RetryExecutor,
    shutdown: ShutdownSignal,
) -> SyncResult<()> {
    loop {
        if shared.abort.load(Ordering::Acquire) || shutdown.is_shutdown_requested() {
            return Ok(());
        }
        let Some((index, attendee_id)) = shared.queue.lock().await.pop_front() else {
            debug!(worker, "Queue drained");
            return Ok(());
        };

        let api = &shared.api;
        let limiter = &shared.limiter;
        let id = attendee_id.as_str();
        let fetched = retry
            .execute_with_retry(
                move |_attempt| async move {
                    limiter.acquire().await;
                    api.fetch_detail(id).await
                },
                &format!("detail fetch for {}", id),
            )
            .await;

        let entry = match fetched {
            Ok(detail) => CheckpointEntry::fetched(attendee_id, index, detail),
            Err(RetryFailure {
                error: ApiError::Unauthorized(message),
                ..
            }) => {
                shared.abort.store(true, Ordering::Release);
                error!(attendee = %attendee_id, "Credential rejected during enrichment");
                return Err(SyncError::auth(message));
            }
            Err(failure) => {
                warn!(
                    attendee = %attendee_id,
                    attempts = failure.attempts,
                    "Detail unavailable: {}",
                    failure.error
                );
                CheckpointEntry::unavailable(attendee_id, index, failure.to_string())
            }
        };

        shared.checkpoint.mark_done(entry).await.map_err(|e| {
            SyncError::partial(
                RunPhase::Enriching,
                format!("failed to record checkpoint: {}", e),
                true,
            )
        })?;

        let completed = shared.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if completed % PROGRESS_INTERVAL == 0 || completed == shared.total {
            info!(completed, total = shared.total, "Enrichment progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiResult, AttendeePage};
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::model::{AttendeeProfile, DetailRecord};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    struct ScriptedDetails {
        failures: HashMap<String, ApiError>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedDetails {
        fn new(failures: &[(&str, ApiError)]) -> Self {
            Self {
                failures: failures
                    .iter()
                    .map(|(id, e)| (id.to_string(), e.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AttendeeApi for ScriptedDetails {
        async fn list_page(&self, _: Option<&str>, _: u32) -> ApiResult<AttendeePage> {
            Ok(AttendeePage::default())
        }

        async fn fetch_detail(&self, attendee_id: &str) -> ApiResult<DetailRecord> {
            self.calls.lock().await.push(attendee_id.to_string());
            if let Some(err) = self.failures.get(attendee_id) {
                return Err(err.clone());
            }
            Ok(DetailRecord {
                email: Some(format!("{}@example.com", attendee_id.to_lowercase())),
                ..Default::default()
            })
        }
    }

    fn roster(ids: &[&str]) -> Vec<AttendeeRecord> {
        ids.iter()
            .map(|id| AttendeeRecord::shell(*id, AttendeeProfile::default(), json!({ "id": id })))
            .collect()
    }

    fn config() -> EnricherConfig {
        EnricherConfig {
            workers: 3,
            rate_limit: RateLimit {
                requests: 100,
                window: Duration::from_millis(10),
            },
            retry: RetryConfig {
                attempts: 2,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_enriches_every_attendee() {
        let api = Arc::new(ScriptedDetails::new(&[]));
        let enricher = Enricher::new(api.clone(), config(), ShutdownSignal::new());
        let checkpoint = Arc::new(MemoryCheckpointStore::new("run"));

        let enriched = enricher
            .enrich(roster(&["A", "B", "C", "D"]), checkpoint.clone())
            .await
            .unwrap();

        assert_eq!(enriched.report.fetched, 4);
        assert_eq!(enriched.attendees[2].profile.email.as_deref(), Some("c@example.com"));
        assert_eq!(checkpoint.summary().await.completed, 4);
    }

    #[tokio::test]
    async fn test_item_failure_is_recorded_unavailable() {
        let api = Arc::new(ScriptedDetails::new(&[(
            "B",
            ApiError::Transient("503".into()),
        )]));
        let enricher = Enricher::new(api.clone(), config(), ShutdownSignal::new());

        let enriched = enricher
            .enrich(roster(&["A", "B"]), Arc::new(MemoryCheckpointStore::new("run")))
            .await
            .unwrap();

        assert_eq!(enriched.report.unavailable, 1);
        assert!(enriched.attendees[1].detail_status.is_unavailable());
        let calls = api.calls.lock().await;
        assert_eq!(calls.iter().filter(|id| *id == "B").count(), 2);
    }

    #[tokio::test]
    async fn test_authentication_failure_aborts_phase() {
        let api = Arc::new(ScriptedDetails::new(&[(
            "A",
            ApiError::Unauthorized("401".into()),
        )]));
        let enricher = Enricher::new(
            api,
            EnricherConfig {
                workers: 1,
                ..config()
            },
            ShutdownSignal::new(),
        );
        let checkpoint = Arc::new(MemoryCheckpointStore::new("run"));

        let err = enricher
            .enrich(roster(&["A", "B", "C"]), checkpoint.clone())
            .await
            .unwrap_err();

        assert!(err.is_authentication());
        assert!(!checkpoint.is_done("B").await);
    }

    #[tokio::test]
    async fn test_checkpointed_items_are_not_refetched() {
        let api = Arc::new(ScriptedDetails::new(&[]));
        let checkpoint = Arc::new(MemoryCheckpointStore::new("run"));
        checkpoint
            .mark_done(CheckpointEntry::fetched("A", 0, DetailRecord::default()))
            .await
            .unwrap();
        checkpoint
            .mark_done(CheckpointEntry::unavailable("B", 1, "earlier failure"))
            .await
            .unwrap();

        let enricher = Enricher::new(api.clone(), config(), ShutdownSignal::new());
        let enriched = enricher
            .enrich(roster(&["A", "B", "C"]), checkpoint)
            .await
            .unwrap();

        assert_eq!(*api.calls.lock().await, vec!["C".to_string()]);
        assert_eq!(enriched.report.resumed, 2);
        assert!(enriched.attendees[1].detail_status.is_unavailable());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_enrichment() {
        let shutdown = ShutdownSignal::new();
        shutdown.request_shutdown();
        let enricher = Enricher::new(Arc::new(ScriptedDetails::new(&[])), config(), shutdown);

        let err = enricher
            .enrich(roster(&["A"]), Arc::new(MemoryCheckpointStore::new("run")))
            .await
            .unwrap_err();
        assert!(err.is_interrupted());
    }
}
