//! Domain types shared by the Lister, Enricher and Merger
//!
//! [`AttendeeRecord`] is what flows between pipeline stages and into run
//! artifacts. [`StoredAttendee`], [`RunRecord`] and [`AttendeeChange`] are the
//! three durable relations owned by the Merger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Build the unique placeholder email used when an attendee has none
pub fn placeholder_email(attendee_id: &str) -> String {
    format!("noemail_{}@placeholder.com", attendee_id)
}

/// Which stage owns a profile field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Populated by the Lister from the directory listing
    Shell,
    /// Populated only by the Enricher
    Detail,
}

/// One field-level difference between a stored and an incoming profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

macro_rules! profile_fields {
    ($($field:ident : $kind:ident),+ $(,)?) => {
        /// Every mutable attribute of an attendee, named as the store columns
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct AttendeeProfile {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<String>,
            )+
        }

        impl AttendeeProfile {
            /// Field names with their owning stage, in column order
            pub const FIELDS: &'static [(&'static str, FieldKind)] =
                &[$((stringify!($field), FieldKind::$kind)),+];

            /// All field values in column order
            pub fn values(&self) -> Vec<(&'static str, Option<&str>)> {
                vec![$((stringify!($field), self.$field.as_deref())),+]
            }

            fn slots_mut(&mut self) -> Vec<(&'static str, &mut Option<String>)> {
                vec![$((stringify!($field), &mut self.$field)),+]
            }
        }
    };
}

profile_fields! {
    user_id: Shell,
    email: Detail,
    first_name: Shell,
    last_name: Shell,
    job_title: Shell,
    organization: Shell,
    biography: Shell,
    mobile_phone: Detail,
    landline_phone: Detail,
    website_url: Detail,
    photo_url: Shell,
    detail_country: Detail,
    detail_province: Detail,
    detail_language: Detail,
    detail_industry: Detail,
    detail_org_type: Detail,
    detail_position_type: Detail,
    detail_ai_maturity: Detail,
    detail_category: Detail,
    detail_interests: Detail,
    detail_motivation: Detail,
    social_linkedin: Detail,
    social_twitter: Detail,
    social_facebook: Detail,
    social_instagram: Detail,
    social_github: Detail,
    social_dribbble: Detail,
    social_pinterest: Detail,
    social_skype: Detail,
    social_googleplus: Detail,
    social_vimeo: Detail,
    social_youtube: Detail,
}

impl AttendeeProfile {
    /// Look up a field value by column name
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values()
            .into_iter()
            .find(|(name, _)| *name == field)
            .and_then(|(_, value)| value)
    }

    /// Set a field by column name; returns false for an unknown field
    pub fn set(&mut self, field: &str, value: Option<String>) -> bool {
        match self.slots_mut().into_iter().find(|(name, _)| *name == field) {
            Some((_, slot)) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn is_detail_field(field: &str) -> bool {
        Self::FIELDS
            .iter()
            .any(|(name, kind)| *name == field && *kind == FieldKind::Detail)
    }

    /// Copy the enrichment-owned subset from `detail`
    pub fn apply_detail(&mut self, detail: &DetailRecord) {
        self.email = detail.email.clone();
        self.mobile_phone = detail.mobile_phone.clone();
        self.landline_phone = detail.landline_phone.clone();
        self.website_url = detail.website_url.clone();
        self.detail_country = detail.country.clone();
        self.detail_province = detail.province.clone();
        self.detail_language = detail.language.clone();
        self.detail_industry = detail.industry.clone();
        self.detail_org_type = detail.org_type.clone();
        self.detail_position_type = detail.position_type.clone();
        self.detail_ai_maturity = detail.ai_maturity.clone();
        self.detail_category = detail.category.clone();
        self.detail_interests = detail.interests.clone();
        self.detail_motivation = detail.motivation.clone();
        self.social_linkedin = detail.social.linkedin.clone();
        self.social_twitter = detail.social.twitter.clone();
        self.social_facebook = detail.social.facebook.clone();
        self.social_instagram = detail.social.instagram.clone();
        self.social_github = detail.social.github.clone();
        self.social_dribbble = detail.social.dribbble.clone();
        self.social_pinterest = detail.social.pinterest.clone();
        self.social_skype = detail.social.skype.clone();
        self.social_googleplus = detail.social.googleplus.clone();
        self.social_vimeo = detail.social.vimeo.clone();
        self.social_youtube = detail.social.youtube.clone();
    }

    /// Replace the detail subset with the values held by `other`
    pub fn keep_details_from(&mut self, other: &AttendeeProfile) {
        for (name, slot) in self.slots_mut() {
            if Self::is_detail_field(name) {
                *slot = other.get(name).map(str::to_string);
            }
        }
    }

    /// Field-level differences from `self` (stored) to `incoming`
    pub fn diff(&self, incoming: &AttendeeProfile) -> Vec<FieldChange> {
        self.values()
            .into_iter()
            .zip(incoming.values())
            .filter(|((_, old), (_, new))| old != new)
            .map(|((field, old), (_, new))| FieldChange {
                field,
                old_value: old.map(str::to_string),
                new_value: new.map(str::to_string),
            })
            .collect()
    }
}

/// Social network handles attached to a detail record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialProfiles {
    pub linkedin: Option<String>,
    pub twitter: Option<String>,
    pub facebook: Option<String>,
    pub instagram: Option<String>,
    pub github: Option<String>,
    pub dribbble: Option<String>,
    pub pinterest: Option<String>,
    pub skype: Option<String>,
    pub googleplus: Option<String>,
    pub vimeo: Option<String>,
    pub youtube: Option<String>,
}

impl SocialProfiles {
    /// Record a profile for a network type as reported by the API
    ///
    /// Returns false when the network is not one we keep.
    pub fn set(&mut self, network: &str, profile: String) -> bool {
        let slot = match network.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "linkedin" => &mut self.linkedin,
            "twitter" | "x" => &mut self.twitter,
            "facebook" => &mut self.facebook,
            "instagram" => &mut self.instagram,
            "github" => &mut self.github,
            "dribbble" => &mut self.dribbble,
            "pinterest" => &mut self.pinterest,
            "skype" => &mut self.skype,
            "googleplus" | "google" => &mut self.googleplus,
            "vimeo" => &mut self.vimeo,
            "youtube" => &mut self.youtube,
            _ => return false,
        };
        *slot = Some(profile);
        true
    }
}

/// Per-attendee enrichment payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub email: Option<String>,
    pub mobile_phone: Option<String>,
    pub landline_phone: Option<String>,
    pub website_url: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub language: Option<String>,
    pub industry: Option<String>,
    pub org_type: Option<String>,
    pub position_type: Option<String>,
    pub ai_maturity: Option<String>,
    pub category: Option<String>,
    pub interests: Option<String>,
    pub motivation: Option<String>,
    #[serde(default)]
    pub social: SocialProfiles,
    /// Untouched API payload
    #[serde(default)]
    pub raw: Value,
}

/// Enrichment state of a single attendee
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetailStatus {
    /// Not yet enriched (Lister output)
    #[default]
    Pending,
    Fetched,
    /// Detail fetch exhausted its retries or was rejected for this item
    Unavailable { reason: String },
}

impl DetailStatus {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Raw API payloads retained for forward compatibility
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub listing: Value,
    /// `None` when no detail was fetched; a fetched `null` stays `Some(Null)`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub detail: Option<Value>,
}

/// Any value present under the key, `null` included
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl RawPayload {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "listing": self.listing,
            "detail": self.detail,
        })
    }
}

/// One external identity as it moves through a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeRecord {
    /// Stable external id (primary key)
    pub id: String,
    #[serde(flatten)]
    pub profile: AttendeeProfile,
    #[serde(default)]
    pub detail_status: DetailStatus,
    #[serde(default)]
    pub raw: RawPayload,
}

impl AttendeeRecord {
    /// Create a shell record as produced by the Lister
    pub fn shell(id: impl Into<String>, profile: AttendeeProfile, listing: Value) -> Self {
        Self {
            id: id.into(),
            profile,
            detail_status: DetailStatus::Pending,
            raw: RawPayload {
                listing,
                detail: None,
            },
        }
    }

    /// Attach a fetched detail record
    pub fn apply_detail(&mut self, detail: &DetailRecord) {
        self.profile.apply_detail(detail);
        self.detail_status = DetailStatus::Fetched;
        self.raw.detail = Some(detail.raw.clone());
    }

    /// Record that no detail could be obtained for this run
    pub fn mark_unavailable(&mut self, reason: impl Into<String>) {
        self.detail_status = DetailStatus::Unavailable {
            reason: reason.into(),
        };
    }
}

/// Persisted attendee row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttendee {
    pub id: String,
    pub profile: AttendeeProfile,
    /// False when the last run that saw this attendee could not fetch its detail
    pub detail_available: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub update_count: u32,
    pub last_seen_run_id: i64,
    #[serde(default)]
    pub raw_data: Value,
}

impl StoredAttendee {
    /// The stored email; rows always carry one
    pub fn email(&self) -> &str {
        self.profile.email.as_deref().unwrap_or_default()
    }
}

/// Final status of a run row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Registered, merge not yet committed
    Partial,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "partial" => Ok(Self::Partial),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Values needed to register a run with the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub run_timestamp: DateTime<Utc>,
    pub total_attendees: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// One execution of the pipeline as recorded in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_timestamp: DateTime<Utc>,
    pub total_attendees: u64,
    pub new_attendees: u64,
    pub updated_attendees: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Append-only field-level mutation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendeeChange {
    pub id: i64,
    pub attendee_id: String,
    pub run_id: i64,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Derived aggregate view over the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_attendees: u64,
    pub unique_organizations: u64,
    pub unique_countries: u64,
    pub unique_industries: u64,
    pub detail_unavailable: u64,
    pub total_runs: u64,
    pub completed_runs: u64,
    pub total_changes: u64,
    pub latest_completed_run: Option<DateTime<Utc>>,
}
