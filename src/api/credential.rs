//! Bearer credential handling
//!
//! The token is opaque to the pipeline. When it happens to be a JWT its `exp`
//! claim is checked up front so an expired token fails the run before the
//! first request instead of on page one.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
}

impl Credential {
    /// Accept a raw token or a full `Bearer <token>` header value
    pub fn new(raw: &str) -> SyncResult<Self> {
        let trimmed = raw.trim();
        let token = trimmed
            .strip_prefix("Bearer ")
            .or_else(|| trimmed.strip_prefix("bearer "))
            .unwrap_or(trimmed)
            .trim();
        if token.is_empty() {
            return Err(SyncError::auth("no bearer token configured"));
        }
        Ok(Self {
            token: token.to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Expiry from the JWT `exp` claim, if the token is a JWT carrying one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let claims = self.claims()?;
        let exp = claims.get("exp")?;
        let seconds = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
        Utc.timestamp_opt(seconds, 0).single()
    }

    fn claims(&self) -> Option<Value> {
        let mut parts = self.token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Fail when the token expires within `margin` of `now`
    pub fn validate_at(&self, now: DateTime<Utc>, margin: Duration) -> SyncResult<TokenStatus> {
        let Some(expires_at) = self.expires_at() else {
            debug!("Bearer token carries no expiry claim; accepting as opaque");
            return Ok(TokenStatus {
                expires_at: None,
                remaining: None,
            });
        };

        let remaining = expires_at - now;
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        if remaining <= chrono::Duration::zero() {
            return Err(SyncError::AuthenticationFailed {
                message: format!("bearer token expired at {}", expires_at),
            });
        }
        if remaining < margin {
            return Err(SyncError::AuthenticationFailed {
                message: format!(
                    "bearer token expires at {} (in {}s), inside the {}s safety margin",
                    expires_at,
                    remaining.num_seconds(),
                    margin.num_seconds()
                ),
            });
        }
        Ok(TokenStatus {
            expires_at: Some(expires_at),
            remaining: remaining.to_std().ok(),
        })
    }

    pub fn validate(&self, margin: Duration) -> SyncResult<TokenStatus> {
        self.validate_at(Utc::now(), margin)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Outcome of a successful credential check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStatus {
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: Option<Duration>,
}

#[cfg(test)]
pub(crate) fn jwt_with_exp(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"type":"access-token","exp":{}}}"#, exp));
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_bearer_prefix() {
        let credential = Credential::new("Bearer abc.def").unwrap();
        assert_eq!(credential.token(), "abc.def");
        assert_eq!(credential.authorization_header(), "Bearer abc.def");
        assert!(Credential::new("   ").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let credential = Credential::new("secret-token").unwrap();
        assert!(!format!("{:?}", credential).contains("secret-token"));
    }

    #[test]
    fn test_jwt_expiry_checks() {
        let now = Utc::now();
        let margin = Duration::from_secs(300);

        let valid = Credential::new(&jwt_with_exp(now.timestamp() + 3600)).unwrap();
        let status = valid.validate_at(now, margin).unwrap();
        assert_eq!(status.expires_at.unwrap().timestamp(), now.timestamp() + 3600);

        let expired = Credential::new(&jwt_with_exp(now.timestamp() - 10)).unwrap();
        assert!(expired.validate_at(now, margin).unwrap_err().is_authentication());

        let expiring = Credential::new(&jwt_with_exp(now.timestamp() + 60)).unwrap();
        assert!(expiring.validate_at(now, margin).is_err());
    }

    #[test]
    fn test_opaque_token_is_accepted() {
        let credential = Credential::new("not-a-jwt").unwrap();
        let status = credential.validate(Duration::from_secs(300)).unwrap();
        assert!(status.expires_at.is_none());
    }
}
