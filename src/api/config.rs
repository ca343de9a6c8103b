//! Remote API configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub graphql_url: String,

    pub origin: String,

    pub event_id: String,

    pub event_slug: String,

    /// People view listing the event's attendees
    pub view_id: String,

    /// Persisted query hash of `EventPeopleListViewConnectionQuery`
    pub list_query_hash: String,

    /// Persisted query hash of the detail query; the full document is sent when unset
    pub detail_query_hash: Option<String>,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    pub client_platform: String,

    pub client_version: String,

    pub user_agent: String,

    /// Reject tokens expiring sooner than this
    #[serde(with = "humantime_serde")]
    pub token_expiry_margin: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            graphql_url: "https://app.swapcard.com/api/graphql".to_string(),
            origin: "https://app.swapcard.com".to_string(),
            event_id: "RXZlbnRfMjU3MTcxMQ==".to_string(),
            event_slug: "all-in-2025".to_string(),
            view_id: "RXZlbnRWaWV3XzEwNTU5ODE=".to_string(),
            list_query_hash: "69e1ba85ea607db3bda1d9a656348cb545879099d7ee11aa3e7449d0e4f8a408"
                .to_string(),
            detail_query_hash: None,
            request_timeout: Duration::from_secs(30),
            client_platform: "Event App".to_string(),
            client_version: "2.309.297".to_string(),
            user_agent: concat!("rostersync/", env!("CARGO_PKG_VERSION")).to_string(),
            token_expiry_margin: Duration::from_secs(5 * 60),
        }
    }
}

impl ApiConfig {
    /// Host part of the origin, sent as `x-client-origin`
    pub fn client_origin(&self) -> &str {
        self.origin
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(&self.origin)
            .trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_origin_strips_scheme() {
        let config = ApiConfig::default();
        assert_eq!(config.client_origin(), "app.swapcard.com");
    }
}
