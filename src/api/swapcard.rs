//! reqwest client for the Swapcard GraphQL API

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, ORIGIN, USER_AGENT};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::response::{parse_detail, parse_listing};
use super::{ApiConfig, ApiError, ApiResult, AttendeeApi, AttendeePage, Credential};
use crate::error::{SyncError, SyncResult};
use crate::model::DetailRecord;

const LIST_OPERATION: &str = "EventPeopleListViewConnectionQuery";
const DETAIL_OPERATION: &str = "EventPersonDetailsQuery";

const DETAIL_QUERY: &str = r#"
query EventPersonDetailsQuery($personId: ID!, $eventId: ID!) {
  person: eventPerson(id: $personId, eventId: $eventId) {
    id
    userId
    email
    mobilePhone
    landlinePhone
    websiteUrl
    socialNetworks { type profile }
    withEvent(eventId: $eventId) {
      fields {
        definition { name }
        ... on SelectField { value }
        ... on MultipleSelectField { values }
        ... on TextField { value }
      }
    }
  }
}
"#;

pub struct SwapcardClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl SwapcardClient {
    pub fn new(config: ApiConfig, credential: &Credential) -> SyncResult<Self> {
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| SyncError::config(format!("invalid header value: {}", e)))
        };

        let mut headers = HeaderMap::new();
        let mut auth = header(credential.authorization_header().as_str())?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, header(config.origin.as_str())?);
        headers.insert(USER_AGENT, header(config.user_agent.as_str())?);
        headers.insert(
            HeaderName::from_static("x-client-origin"),
            header(config.client_origin())?,
        );
        headers.insert(
            HeaderName::from_static("x-client-platform"),
            header(config.client_platform.as_str())?,
        );
        headers.insert(
            HeaderName::from_static("x-client-version"),
            header(config.client_version.as_str())?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    fn list_body(&self, cursor: Option<&str>, page_size: u32) -> Value {
        let mut variables = json!({
            "viewId": self.config.view_id,
            "first": page_size,
        });
        if let Some(cursor) = cursor {
            variables["endCursor"] = json!(cursor);
        }
        json!([{
            "operationName": LIST_OPERATION,
            "variables": variables,
            "extensions": {
                "persistedQuery": {"version": 1, "sha256Hash": self.config.list_query_hash}
            }
        }])
    }

    fn detail_body(&self, attendee_id: &str) -> Value {
        let variables = json!({
            "personId": attendee_id,
            "eventId": self.config.event_id,
        });
        match &self.config.detail_query_hash {
            Some(hash) => json!([{
                "operationName": DETAIL_OPERATION,
                "variables": variables,
                "extensions": {"persistedQuery": {"version": 1, "sha256Hash": hash}}
            }]),
            None => json!([{
                "operationName": DETAIL_OPERATION,
                "variables": variables,
                "query": DETAIL_QUERY,
            }]),
        }
    }

    async fn post(&self, body: &Value) -> ApiResult<Value> {
        let response = self
            .http
            .post(&self.config.graphql_url)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        trace!(%status, "GraphQL response");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ApiError::Unauthorized(format!("HTTP {}", status)))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(ApiError::Transient(format!("HTTP {}", status)))
            }
            s if s.is_server_error() => return Err(ApiError::Transient(format!("HTTP {}", s))),
            s if !s.is_success() => return Err(ApiError::Malformed(format!("HTTP {}", s))),
            _ => {}
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Transient(e.to_string())
            } else {
                ApiError::Malformed(format!("invalid JSON body: {}", e))
            }
        })
    }
}

fn classify_transport(err: reqwest::Error) -> ApiError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ApiError::Transient(err.to_string())
    } else {
        ApiError::Malformed(err.to_string())
    }
}

#[async_trait]
impl AttendeeApi for SwapcardClient {
    async fn list_page(&self, cursor: Option<&str>, page_size: u32) -> ApiResult<AttendeePage> {
        debug!(cursor = cursor.unwrap_or("<first>"), "Requesting directory page");
        let body = self.post(&self.list_body(cursor, page_size)).await?;
        parse_listing(&body)
    }

    async fn fetch_detail(&self, attendee_id: &str) -> ApiResult<DetailRecord> {
        let body = self.post(&self.detail_body(attendee_id)).await?;
        parse_detail(attendee_id, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: ApiConfig) -> SwapcardClient {
        SwapcardClient::new(config, &Credential::new("token").unwrap()).unwrap()
    }

    #[test]
    fn test_list_body_carries_cursor_only_after_first_page() {
        let client = client(ApiConfig::default());

        let first = client.list_body(None, 50);
        assert_eq!(first[0]["operationName"], LIST_OPERATION);
        assert!(first[0]["variables"].get("endCursor").is_none());
        assert_eq!(
            first[0]["extensions"]["persistedQuery"]["sha256Hash"],
            "69e1ba85ea607db3bda1d9a656348cb545879099d7ee11aa3e7449d0e4f8a408"
        );

        let next = client.list_body(Some("abc"), 50);
        assert_eq!(next[0]["variables"]["endCursor"], "abc");
        assert_eq!(next[0]["variables"]["first"], 50);
    }

    #[test]
    fn test_detail_body_prefers_persisted_hash() {
        let body = client(ApiConfig::default()).detail_body("A");
        assert!(body[0]["query"].is_string());

        let body = client(ApiConfig {
            detail_query_hash: Some("feed".into()),
            ..Default::default()
        })
        .detail_body("A");
        assert!(body[0].get("query").is_none());
        assert_eq!(body[0]["variables"]["personId"], "A");
    }

    #[test]
    fn test_rejects_invalid_header_values() {
        let config = ApiConfig {
            user_agent: "bad\nagent".into(),
            ..Default::default()
        };
        assert!(SwapcardClient::new(config, &Credential::new("token").unwrap()).is_err());
    }
}
