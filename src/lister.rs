//! Directory listing: cursor pagination into one deduplicated roster

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AttendeeApi};
use crate::error::{SyncError, SyncResult};
use crate::model::AttendeeRecord;
use crate::retry::{RetryConfig, RetryExecutor, RetryFailure};
use crate::run::state::RunPhase;
use crate::signals::ShutdownSignal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListerConfig {
    pub page_size: u32,
    /// Safety limit; a directory that is still paging after this many pages fails
    pub max_pages: u32,
    #[serde(with = "humantime_serde")]
    pub page_delay: Duration,
    pub retry: RetryConfig,
}

impl Default for ListerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 200,
            page_delay: Duration::from_millis(300),
            retry: RetryConfig::default(),
        }
    }
}

/// Complete listing of one run, unique by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub attendees: Vec<AttendeeRecord>,
    /// Directory size reported by the API on the last page
    pub total_reported: Option<u64>,
    pub pages: u32,
}

pub struct Lister {
    api: Arc<dyn AttendeeApi>,
    config: ListerConfig,
    retry: RetryExecutor,
    shutdown: ShutdownSignal,
}

impl Lister {
    pub fn new(api: Arc<dyn AttendeeApi>, config: ListerConfig, shutdown: ShutdownSignal) -> Self {
        let retry = RetryExecutor::new(config.retry.clone());
        Self {
            api,
            config,
            retry,
            shutdown,
        }
    }

    /// Page through the directory until it reports no further cursor
    ///
    /// Nothing is returned unless every page was fetched.
    pub async fn list(&self) -> SyncResult<Roster> {
        let mut attendees: Vec<AttendeeRecord> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut cursor: Option<String> = None;
        let mut total_reported = None;
        let mut page = 0u32;

        loop {
            if self.shutdown.is_shutdown_requested() {
                return Err(SyncError::Interrupted {
                    phase: RunPhase::Listing,
                });
            }
            if page >= self.config.max_pages {
                return Err(SyncError::ListingFailed {
                    page: page + 1,
                    attempts: 0,
                    message: format!("directory still paging after {} pages", self.config.max_pages),
                });
            }
            page += 1;

            let api = &self.api;
            let current = cursor.as_deref();
            let page_size = self.config.page_size;
            let result = self
                .retry
                .execute_with_retry(
                    move |_attempt| async move { api.list_page(current, page_size).await },
                    &format!("directory page {}", page),
                )
                .await;

            let listing = match result {
                Ok(listing) => listing,
                Err(RetryFailure {
                    error: ApiError::Unauthorized(message),
                    ..
                }) => return Err(SyncError::auth(message)),
                Err(RetryFailure { error, attempts }) => {
                    return Err(SyncError::ListingFailed {
                        page,
                        attempts,
                        message: error.to_string(),
                    })
                }
            };

            if listing.skipped > 0 {
                warn!(page, skipped = listing.skipped, "Skipped directory nodes without id");
            }
            if listing.total_count.is_some() {
                total_reported = listing.total_count;
            }
            let received = listing.attendees.len();
            for record in listing.attendees {
                match positions.get(&record.id) {
                    Some(&at) => {
                        debug!(attendee = %record.id, page, "Duplicate id, keeping later record");
                        attendees[at] = record;
                    }
                    None => {
                        positions.insert(record.id.clone(), attendees.len());
                        attendees.push(record);
                    }
                }
            }

            info!(
                page,
                received,
                unique = attendees.len(),
                total = ?total_reported,
                "Fetched directory page"
            );

            match listing.next_cursor {
                Some(next) if received > 0 => cursor = Some(next),
                _ => break,
            }

            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }

        if let Some(total) = total_reported {
            if total != attendees.len() as u64 {
                warn!(
                    total,
                    listed = attendees.len(),
                    "Listed attendee count differs from reported total"
                );
            }
        }

        Ok(Roster {
            attendees,
            total_reported,
            pages: page,
        })
    }
}
