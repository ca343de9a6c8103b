//! Pure merge planning
//!
//! [`build`] compares an enriched roster against the stored rows it touches and
//! produces a [`MergePlan`]: the exact rows to write, the change records to
//! append and any email conflicts that had to be resolved. Nothing here does
//! I/O, so the whole upsert decision is testable in isolation and a backend only
//! has to apply the plan atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::error::{SyncError, SyncResult};
use crate::model::{placeholder_email, AttendeeRecord, RunRecord, StoredAttendee};

/// How to resolve two attendees claiming the same email
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailConflictPolicy {
    /// Existing holder keeps the email; the claimant is flagged for review
    #[default]
    Flag,
    /// The later roster entry takes the email; the previous holder is reassigned
    LastWriteWins,
}

impl EmailConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::LastWriteWins => "last_write_wins",
        }
    }
}

/// An email claimed by more than one attendee, and how it was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub email: String,
    pub kept_by: String,
    pub rejected_id: String,
    /// Email the rejected attendee ended up with
    pub assigned_email: String,
    pub resolution: EmailConflictPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Attendee not previously stored
    Insert,
    /// At least one field differs from the stored row
    Update,
    /// No field differs; only the bookkeeping advances
    Touch,
    /// Attendee outside the roster whose email was taken over
    Reassign,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedWrite {
    pub kind: WriteKind,
    pub row: StoredAttendee,
}

/// A change record before the store assigns it an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub attendee_id: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub total: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub detail_unavailable: u64,
    pub reassigned: u64,
}

/// Everything a backend needs to commit one run's merge
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub run_id: i64,
    pub merged_at: DateTime<Utc>,
    pub writes: Vec<PlannedWrite>,
    pub changes: Vec<PendingChange>,
    pub violations: Vec<IntegrityViolation>,
    pub counts: MergeCounts,
    /// Merged into the run row's metadata on commit
    pub metadata: Value,
}

/// Emails each roster attendee would like to hold, before conflicts
pub fn desired_emails(
    roster: &[AttendeeRecord],
    stored: &HashMap<String, StoredAttendee>,
) -> Vec<String> {
    roster
        .iter()
        .map(|record| desired_email(record, stored.get(&record.id)))
        .collect()
}

fn normalize_email(email: Option<&str>) -> Option<String> {
    email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

fn desired_email(record: &AttendeeRecord, stored: Option<&StoredAttendee>) -> String {
    let email = if record.detail_status.is_unavailable() {
        stored.and_then(|s| normalize_email(s.profile.email.as_deref()))
    } else {
        normalize_email(record.profile.email.as_deref())
    };
    email.unwrap_or_else(|| placeholder_email(&record.id))
}

/// Build the merge plan for one run
///
/// `stored` holds the existing rows for the roster ids and for every current
/// holder of a desired email; `email_owners` maps each desired email that is
/// already stored to the id holding it.
pub fn build(
    run: &RunRecord,
    roster: &[AttendeeRecord],
    stored: &HashMap<String, StoredAttendee>,
    email_owners: &HashMap<String, String>,
    policy: EmailConflictPolicy,
) -> SyncResult<MergePlan> {
    let roster = dedup_roster(roster);
    let roster_ids: HashSet<&str> = roster.iter().map(|r| r.id.as_str()).collect();
    let desired: Vec<String> = roster
        .iter()
        .map(|r| desired_email(r, stored.get(&r.id)))
        .collect();

    let resolution = resolve_emails(&roster, &desired, stored, email_owners, &roster_ids, policy);
    verify_unique(&resolution.assigned, &resolution.displaced)?;

    let at = run.run_timestamp;
    let mut writes = Vec::with_capacity(roster.len() + resolution.displaced.len());
    let mut changes = Vec::new();
    let mut counts = MergeCounts {
        total: roster.len() as u64,
        ..Default::default()
    };

    for record in &roster {
        let unavailable = record.detail_status.is_unavailable();
        if unavailable {
            counts.detail_unavailable += 1;
        }

        let existing = stored.get(&record.id);
        let mut profile = record.profile.clone();
        if unavailable {
            match existing {
                Some(row) => profile.keep_details_from(&row.profile),
                None => profile.keep_details_from(&Default::default()),
            }
        }
        profile.email = resolution.assigned.get(record.id.as_str()).cloned();

        let raw_data = match (unavailable, existing) {
            (true, Some(row)) => json!({
                "listing": record.raw.listing,
                "detail": row.raw_data.get("detail").cloned().unwrap_or(Value::Null),
            }),
            _ => record.raw.to_value(),
        };

        let Some(row) = existing else {
            counts.new += 1;
            writes.push(PlannedWrite {
                kind: WriteKind::Insert,
                row: StoredAttendee {
                    id: record.id.clone(),
                    profile,
                    detail_available: !unavailable,
                    first_seen_at: at,
                    last_updated_at: at,
                    update_count: 0,
                    last_seen_run_id: run.id,
                    raw_data,
                },
            });
            continue;
        };

        let diff = row.profile.diff(&profile);
        let mut next = row.clone();
        next.profile = profile;
        next.detail_available = !unavailable;
        next.last_seen_run_id = run.id;
        next.raw_data = raw_data;

        let kind = if diff.is_empty() {
            counts.unchanged += 1;
            WriteKind::Touch
        } else {
            counts.updated += 1;
            next.update_count += 1;
            next.last_updated_at = at;
            changes.extend(diff.into_iter().map(|c| PendingChange {
                attendee_id: record.id.clone(),
                field_name: c.field.to_string(),
                old_value: c.old_value,
                new_value: c.new_value,
            }));
            WriteKind::Update
        };
        writes.push(PlannedWrite { kind, row: next });
    }

    for (id, email) in &resolution.displaced {
        let Some(row) = stored.get(id.as_str()) else {
            continue;
        };
        counts.reassigned += 1;
        let mut next = row.clone();
        changes.push(PendingChange {
            attendee_id: id.clone(),
            field_name: "email".to_string(),
            old_value: row.profile.email.clone(),
            new_value: Some(email.clone()),
        });
        next.profile.email = Some(email.clone());
        next.update_count += 1;
        next.last_updated_at = at;
        writes.push(PlannedWrite {
            kind: WriteKind::Reassign,
            row: next,
        });
    }

    for violation in &resolution.violations {
        warn!(
            email = %violation.email,
            kept_by = %violation.kept_by,
            rejected = %violation.rejected_id,
            assigned = %violation.assigned_email,
            policy = violation.resolution.as_str(),
            "Email claimed by more than one attendee"
        );
    }

    let metadata = json!({
        "detail_unavailable": counts.detail_unavailable,
        "unchanged_attendees": counts.unchanged,
        "reassigned_attendees": counts.reassigned,
        "integrity_violations": resolution.violations,
    });

    Ok(MergePlan {
        run_id: run.id,
        merged_at: at,
        writes,
        changes,
        violations: resolution.violations,
        counts,
        metadata,
    })
}

/// Collapse duplicate ids; the later record wins but keeps the first position
fn dedup_roster(roster: &[AttendeeRecord]) -> Vec<AttendeeRecord> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(roster.len());
    let mut out: Vec<AttendeeRecord> = Vec::with_capacity(roster.len());
    for record in roster {
        match index.get(record.id.as_str()) {
            Some(&i) => out[i] = record.clone(),
            None => {
                index.insert(record.id.as_str(), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

#[derive(Debug, Default)]
struct EmailResolution {
    /// Final email for each roster id
    assigned: HashMap<String, String>,
    /// Stored attendees outside the roster that lose their email
    displaced: Vec<(String, String)>,
    violations: Vec<IntegrityViolation>,
}

fn resolve_emails(
    roster: &[AttendeeRecord],
    desired: &[String],
    stored: &HashMap<String, StoredAttendee>,
    email_owners: &HashMap<String, String>,
    roster_ids: &HashSet<&str>,
    policy: EmailConflictPolicy,
) -> EmailResolution {
    // Claimants per email, in roster order
    let mut claims: Vec<(&str, Vec<usize>)> = Vec::new();
    let mut claim_index: HashMap<&str, usize> = HashMap::new();
    for (i, email) in desired.iter().enumerate() {
        match claim_index.get(email.as_str()) {
            Some(&c) => claims[c].1.push(i),
            None => {
                claim_index.insert(email.as_str(), claims.len());
                claims.push((email.as_str(), vec![i]));
            }
        }
    }

    let mut resolution = EmailResolution::default();
    let mut taken: HashSet<String> = HashSet::new();
    // (roster index, contested email, holder that kept it)
    let mut losers: Vec<(usize, &str, String)> = Vec::new();

    for (email, claimants) in &claims {
        let outside_holder = email_owners
            .get(*email)
            .filter(|holder| !roster_ids.contains(holder.as_str()));

        let winner: Option<usize> = match policy {
            EmailConflictPolicy::Flag if outside_holder.is_some() => None,
            EmailConflictPolicy::Flag => Some(
                claimants
                    .iter()
                    .copied()
                    .find(|&i| email_owners.get(*email) == Some(&roster[i].id))
                    .unwrap_or(claimants[0]),
            ),
            EmailConflictPolicy::LastWriteWins => claimants.last().copied(),
        };

        let kept_by = match (winner, outside_holder) {
            (Some(i), _) => roster[i].id.clone(),
            (None, Some(holder)) => holder.clone(),
            (None, None) => continue,
        };

        if let Some(i) = winner {
            resolution
                .assigned
                .insert(roster[i].id.clone(), email.to_string());
            if let Some(holder) = outside_holder {
                resolution
                    .displaced
                    .push((holder.clone(), placeholder_email(holder)));
                resolution.violations.push(IntegrityViolation {
                    email: email.to_string(),
                    kept_by: kept_by.clone(),
                    rejected_id: holder.clone(),
                    assigned_email: placeholder_email(holder),
                    resolution: policy,
                });
            }
        }
        taken.insert(email.to_string());

        for &i in claimants.iter().filter(|&&i| Some(i) != winner) {
            losers.push((i, *email, kept_by.clone()));
        }
    }

    // Emails still held by stored rows outside the roster that were not displaced
    let displaced_ids: HashSet<&str> = resolution.displaced.iter().map(|(id, _)| id.as_str()).collect();
    for (email, holder) in email_owners {
        if !roster_ids.contains(holder.as_str()) && !displaced_ids.contains(holder.as_str()) {
            taken.insert(email.clone());
        }
    }

    for (i, email, kept_by) in losers {
        let id = &roster[i].id;
        let fallback = stored
            .get(id)
            .and_then(|row| normalize_email(row.profile.email.as_deref()))
            .filter(|previous| previous != email && !taken.contains(previous))
            .unwrap_or_else(|| placeholder_email(id));
        taken.insert(fallback.clone());
        resolution.assigned.insert(id.clone(), fallback.clone());
        resolution.violations.push(IntegrityViolation {
            email: email.to_string(),
            kept_by,
            rejected_id: id.clone(),
            assigned_email: fallback,
            resolution: policy,
        });
    }

    resolution
}

fn verify_unique(
    assigned: &HashMap<String, String>,
    displaced: &[(String, String)],
) -> SyncResult<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let all = assigned
        .iter()
        .map(|(id, email)| (id.as_str(), email.as_str()))
        .chain(displaced.iter().map(|(id, email)| (id.as_str(), email.as_str())));
    for (id, email) in all {
        if let Some(other) = seen.insert(email, id) {
            return Err(SyncError::DataIntegrityViolation {
                message: format!("email {} resolved to both {} and {}", email, other, id),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttendeeProfile, RunStatus};

    fn run(id: i64) -> RunRecord {
        RunRecord {
            id,
            run_timestamp: Utc::now(),
            total_attendees: 0,
            new_attendees: 0,
            updated_attendees: 0,
            status: RunStatus::Partial,
            error_message: None,
            metadata: Value::Null,
            finished_at: None,
        }
    }

    fn record(id: &str, email: Option<&str>, title: &str) -> AttendeeRecord {
        let mut r = AttendeeRecord::shell(
            id,
            AttendeeProfile {
                first_name: Some(id.to_string()),
                job_title: Some(title.to_string()),
                ..Default::default()
            },
            json!({"id": id}),
        );
        r.profile.email = email.map(str::to_string);
        r.detail_status = crate::model::DetailStatus::Fetched;
        r
    }

    fn stored_from(plan: &MergePlan) -> HashMap<String, StoredAttendee> {
        plan.writes
            .iter()
            .map(|w| (w.row.id.clone(), w.row.clone()))
            .collect()
    }

    fn owners(stored: &HashMap<String, StoredAttendee>) -> HashMap<String, String> {
        stored
            .values()
            .map(|s| (s.email().to_string(), s.id.clone()))
            .collect()
    }

    #[test]
    fn test_first_merge_inserts_everything() {
        let roster = vec![
            record("A", Some("a@x.io"), "Eng"),
            record("B", Some("b@x.io"), "Eng"),
            record("C", None, "Eng"),
        ];
        let plan = build(&run(1), &roster, &HashMap::new(), &HashMap::new(), Default::default())
            .unwrap();

        assert_eq!(plan.counts.new, 3);
        assert_eq!(plan.counts.updated, 0);
        assert!(plan.changes.is_empty());
        assert!(plan.writes.iter().all(|w| w.kind == WriteKind::Insert));
        let c = plan.writes.iter().find(|w| w.row.id == "C").unwrap();
        assert_eq!(c.row.email(), "noemail_C@placeholder.com");
    }

    #[test]
    fn test_changed_field_produces_one_change_row() {
        let roster = vec![record("A", Some("a@x.io"), "Eng"), record("B", Some("b@x.io"), "Eng")];
        let first = build(&run(1), &roster, &HashMap::new(), &HashMap::new(), Default::default())
            .unwrap();
        let stored = stored_from(&first);

        let roster = vec![record("A", Some("a@x.io"), "Eng"), record("B", Some("b@x.io"), "CTO")];
        let plan = build(&run(2), &roster, &stored, &owners(&stored), Default::default()).unwrap();

        assert_eq!(plan.counts.updated, 1);
        assert_eq!(plan.counts.unchanged, 1);
        assert_eq!(
            plan.changes,
            vec![PendingChange {
                attendee_id: "B".into(),
                field_name: "job_title".into(),
                old_value: Some("Eng".into()),
                new_value: Some("CTO".into()),
            }]
        );
        let a = plan.writes.iter().find(|w| w.row.id == "A").unwrap();
        assert_eq!(a.kind, WriteKind::Touch);
        assert_eq!(a.row.last_seen_run_id, 2);
        assert_eq!(a.row.update_count, 0);
    }

    #[test]
    fn test_unavailable_detail_keeps_stored_subset() {
        let mut first = record("A", Some("a@x.io"), "Eng");
        first.profile.detail_country = Some("Canada".into());
        let plan = build(&run(1), &[first], &HashMap::new(), &HashMap::new(), Default::default())
            .unwrap();
        let stored = stored_from(&plan);

        let mut second = record("A", None, "Eng");
        second.mark_unavailable("timed out");
        let plan = build(&run(2), &[second], &stored, &owners(&stored), Default::default()).unwrap();

        assert!(plan.changes.is_empty());
        let row = &plan.writes[0].row;
        assert_eq!(row.email(), "a@x.io");
        assert_eq!(row.profile.detail_country.as_deref(), Some("Canada"));
        assert!(!row.detail_available);
        assert_eq!(plan.counts.detail_unavailable, 1);
    }

    #[test]
    fn test_flag_policy_keeps_existing_holder() {
        let plan = build(
            &run(1),
            &[record("A", Some("shared@x.io"), "Eng")],
            &HashMap::new(),
            &HashMap::new(),
            EmailConflictPolicy::Flag,
        )
        .unwrap();
        let stored = stored_from(&plan);

        let roster = vec![
            record("A", Some("shared@x.io"), "Eng"),
            record("B", Some("shared@x.io"), "Eng"),
        ];
        let plan = build(&run(2), &roster, &stored, &owners(&stored), EmailConflictPolicy::Flag)
            .unwrap();

        assert_eq!(plan.violations.len(), 1);
        let v = &plan.violations[0];
        assert_eq!(v.kept_by, "A");
        assert_eq!(v.rejected_id, "B");
        assert_eq!(v.assigned_email, "noemail_B@placeholder.com");
        let b = plan.writes.iter().find(|w| w.row.id == "B").unwrap();
        assert_eq!(b.row.email(), "noemail_B@placeholder.com");
        assert_eq!(plan.metadata["integrity_violations"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_flag_policy_against_holder_outside_roster() {
        let plan = build(
            &run(1),
            &[record("A", Some("shared@x.io"), "Eng"), record("B", Some("b@x.io"), "Eng")],
            &HashMap::new(),
            &HashMap::new(),
            EmailConflictPolicy::Flag,
        )
        .unwrap();
        let stored = stored_from(&plan);

        // A is gone from the roster; B now reports A's email
        let roster = vec![record("B", Some("shared@x.io"), "Eng")];
        let plan = build(&run(2), &roster, &stored, &owners(&stored), EmailConflictPolicy::Flag)
            .unwrap();

        let b = &plan.writes[0].row;
        assert_eq!(b.email(), "b@x.io");
        assert!(plan.changes.is_empty());
        assert_eq!(plan.violations[0].kept_by, "A");
    }

    #[test]
    fn test_last_write_wins_reassigns_previous_holder() {
        let plan = build(
            &run(1),
            &[record("A", Some("shared@x.io"), "Eng")],
            &HashMap::new(),
            &HashMap::new(),
            EmailConflictPolicy::LastWriteWins,
        )
        .unwrap();
        let stored = stored_from(&plan);

        let roster = vec![record("B", Some("shared@x.io"), "Eng")];
        let plan = build(
            &run(2),
            &roster,
            &stored,
            &owners(&stored),
            EmailConflictPolicy::LastWriteWins,
        )
        .unwrap();

        let a = plan.writes.iter().find(|w| w.row.id == "A").unwrap();
        assert_eq!(a.kind, WriteKind::Reassign);
        assert_eq!(a.row.email(), "noemail_A@placeholder.com");
        assert_eq!(a.row.last_seen_run_id, 1);
        let b = plan.writes.iter().find(|w| w.row.id == "B").unwrap();
        assert_eq!(b.row.email(), "shared@x.io");
        assert_eq!(plan.counts.reassigned, 1);
        assert!(plan
            .changes
            .iter()
            .any(|c| c.attendee_id == "A" && c.field_name == "email"));
    }

    #[test]
    fn test_duplicate_ids_collapse_to_last_record() {
        let roster = vec![
            record("A", Some("a@x.io"), "Eng"),
            record("A", Some("a@x.io"), "CTO"),
        ];
        let plan = build(&run(1), &roster, &HashMap::new(), &HashMap::new(), Default::default())
            .unwrap();
        assert_eq!(plan.writes.len(), 1);
        assert_eq!(plan.writes[0].row.profile.job_title.as_deref(), Some("CTO"));
        assert!(plan.violations.is_empty());
    }

    #[test]
    fn test_remerge_is_noop() {
        let roster = vec![record("A", Some("a@x.io"), "Eng"), record("B", None, "Eng")];
        let first = build(&run(1), &roster, &HashMap::new(), &HashMap::new(), Default::default())
            .unwrap();
        let stored = stored_from(&first);
        let second = build(&run(1), &roster, &stored, &owners(&stored), Default::default()).unwrap();

        assert!(second.changes.is_empty());
        assert_eq!(second.counts.unchanged, 2);
        assert_eq!(stored_from(&second), stored);
    }
}
