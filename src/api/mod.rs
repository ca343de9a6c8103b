//! Remote attendee directory API
//!
//! [`AttendeeApi`] is the seam between the pipeline and the network: the
//! Lister pages through [`AttendeeApi::list_page`] and the Enricher calls
//! [`AttendeeApi::fetch_detail`] once per attendee. [`SwapcardClient`] is the
//! production implementation over GraphQL persisted queries.

pub mod config;
pub mod credential;
pub mod response;
pub mod swapcard;

pub use config::ApiConfig;
pub use credential::{Credential, TokenStatus};
pub use swapcard::SwapcardClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{AttendeeRecord, DetailRecord};
use crate::retry::Retryable;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure of a single API request, classified for retry decisions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Credential rejected; every later request would fail the same way
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Network, timeout, throttling or server failure
    #[error("transient failure: {0}")]
    Transient(String),

    /// The requested attendee does not exist (anymore)
    #[error("not found: {0}")]
    NotFound(String),

    /// Response that cannot be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One page of the attendee directory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttendeePage {
    pub attendees: Vec<AttendeeRecord>,
    /// Cursor for the next page; `None` on the last page
    pub next_cursor: Option<String>,
    /// Directory size as reported by the API
    pub total_count: Option<u64>,
    /// Nodes dropped because they carried no id
    pub skipped: usize,
}

#[async_trait]
pub trait AttendeeApi: Send + Sync {
    /// Fetch the page after `cursor` (the first page when `None`)
    async fn list_page(&self, cursor: Option<&str>, page_size: u32) -> ApiResult<AttendeePage>;

    /// Fetch the detail record of one attendee
    async fn fetch_detail(&self, attendee_id: &str) -> ApiResult<DetailRecord>;
}
