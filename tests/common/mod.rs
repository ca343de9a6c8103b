//! Common test utilities: a scripted directory API and pipeline configuration
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rostersync::api::{ApiError, ApiResult, AttendeeApi, AttendeePage};
use rostersync::config::SyncConfig;
use rostersync::enricher::RateLimit;
use rostersync::model::{AttendeeProfile, AttendeeRecord, DetailRecord};
use rostersync::retry::RetryConfig;
use rostersync::signals::ShutdownSignal;
use rostersync::storage::BackendType;

/// In-process directory API serving fixed pages and generated detail records
pub struct FakeApi {
    pages: Vec<Vec<AttendeeRecord>>,
    page_failures: HashMap<usize, ApiError>,
    detail_failures: HashMap<String, ApiError>,
    interrupt_after_details: Option<(usize, ShutdownSignal)>,
    interrupt_listing: Option<ShutdownSignal>,
    list_calls: AtomicUsize,
    detail_calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn new(pages: Vec<Vec<AttendeeRecord>>) -> Self {
        Self {
            pages,
            page_failures: HashMap::new(),
            detail_failures: HashMap::new(),
            interrupt_after_details: None,
            interrupt_listing: None,
            list_calls: AtomicUsize::new(0),
            detail_calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the page at zero-based `index` on every attempt
    pub fn fail_page(mut self, index: usize, error: ApiError) -> Self {
        self.page_failures.insert(index, error);
        self
    }

    pub fn fail_detail(mut self, id: &str, error: ApiError) -> Self {
        self.detail_failures.insert(id.to_string(), error);
        self
    }

    /// Request shutdown on detail request number `count` and leave it hanging
    pub fn interrupt_after_details(mut self, count: usize, signal: ShutdownSignal) -> Self {
        self.interrupt_after_details = Some((count, signal));
        self
    }

    /// Request shutdown while the first page is being served
    pub fn interrupt_listing(mut self, signal: ShutdownSignal) -> Self {
        self.interrupt_listing = Some(signal);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> Vec<String> {
        self.detail_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttendeeApi for FakeApi {
    async fn list_page(&self, cursor: Option<&str>, _page_size: u32) -> ApiResult<AttendeePage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(signal) = &self.interrupt_listing {
            signal.request_shutdown();
        }

        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .strip_prefix("page-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| ApiError::Malformed(format!("unknown cursor {}", cursor)))?,
        };
        if let Some(error) = self.page_failures.get(&index) {
            return Err(error.clone());
        }

        let total: usize = self.pages.iter().map(Vec::len).sum();
        Ok(AttendeePage {
            attendees: self.pages.get(index).cloned().unwrap_or_default(),
            next_cursor: (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1)),
            total_count: Some(total as u64),
            skipped: 0,
        })
    }

    async fn fetch_detail(&self, attendee_id: &str) -> ApiResult<DetailRecord> {
        let served = {
            let mut calls = self.detail_calls.lock().unwrap();
            calls.push(attendee_id.to_string());
            calls.len()
        };
        if let Some((after, signal)) = &self.interrupt_after_details {
            if served >= *after {
                signal.request_shutdown();
                std::future::pending::<()>().await;
            }
        }
        if let Some(error) = self.detail_failures.get(attendee_id) {
            return Err(error.clone());
        }
        Ok(detail_for(attendee_id))
    }
}

/// Deterministic detail record for an attendee id
pub fn detail_for(id: &str) -> DetailRecord {
    DetailRecord {
        email: Some(format!("{}@example.com", id.to_lowercase())),
        country: Some("Canada".to_string()),
        industry: Some("Software".to_string()),
        raw: json!({ "id": id, "email": format!("{}@example.com", id.to_lowercase()) }),
        ..Default::default()
    }
}

pub fn attendee(id: &str, title: &str) -> AttendeeRecord {
    AttendeeRecord::shell(
        id,
        AttendeeProfile {
            first_name: Some(format!("First{}", id)),
            last_name: Some(format!("Last{}", id)),
            job_title: Some(title.to_string()),
            organization: Some("Acme".to_string()),
            ..Default::default()
        },
        json!({ "id": id, "jobTitle": title }),
    )
}

/// Fast configuration rooted at `data_dir`
pub fn test_config(data_dir: &Path) -> SyncConfig {
    let fast_retry = RetryConfig {
        attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: false,
        ..Default::default()
    };

    let mut config = SyncConfig::default();
    config.storage.backend = BackendType::Memory;
    config.storage.data_dir = data_dir.to_path_buf();
    config.lister.page_delay = Duration::ZERO;
    config.lister.retry = fast_retry.clone();
    config.enricher.workers = 3;
    config.enricher.rate_limit = RateLimit {
        requests: 1000,
        window: Duration::from_millis(10),
    };
    config.enricher.retry = fast_retry;
    config
}
