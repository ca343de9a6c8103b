//! Sliding-window rate limiter shared by all enrichment workers

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Aggregate request budget: at most `requests` dispatches per `window`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests: 2,
            window: Duration::from_secs(1),
        }
    }
}

/// Admits at most N requests within any window of the configured length
///
/// Dispatch timestamps are kept in a queue; a caller that would exceed the
/// budget sleeps until the oldest admission leaves the window. The mutex is
/// held across that sleep so waiters are admitted in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    dispatched: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = limit.requests as usize;
        Self {
            limit,
            dispatched: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn limit(&self) -> &RateLimit {
        &self.limit
    }

    /// Wait for admission and record the dispatch
    pub async fn acquire(&self) {
        let budget = self.limit.requests.max(1) as usize;
        let mut dispatched = self.dispatched.lock().await;

        loop {
            let now = Instant::now();
            while let Some(&oldest) = dispatched.front() {
                if now.duration_since(oldest) >= self.limit.window {
                    dispatched.pop_front();
                } else {
                    break;
                }
            }

            if dispatched.len() < budget {
                dispatched.push_back(now);
                return;
            }

            if let Some(&oldest) = dispatched.front() {
                let ready_at = oldest + self.limit.window;
                trace!(wait = ?ready_at.saturating_duration_since(now), "Rate limit reached");
                tokio::time::sleep_until(ready_at).await;
            }
        }
    }
}
