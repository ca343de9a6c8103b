//! GraphQL response parsing and failure classification

use serde_json::Value;
use tracing::warn;

use super::{ApiError, ApiResult, AttendeePage};
use crate::model::{AttendeeProfile, AttendeeRecord, DetailRecord};

/// GraphQL batches answer with an array; single operations with an object
fn operations(body: &Value) -> Vec<&Value> {
    match body {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Non-empty trimmed string at `key`
fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Classify GraphQL-level errors in a response body, if any
pub fn graphql_error(body: &Value) -> Option<ApiError> {
    let errors: Vec<&Value> = operations(body)
        .into_iter()
        .filter_map(|op| op.get("errors").and_then(Value::as_array))
        .flatten()
        .collect();
    let first = errors.first()?;

    let message = text(first, "message").unwrap_or_else(|| first.to_string());
    let code = first
        .pointer("/extensions/code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_uppercase();
    let lower = message.to_ascii_lowercase();

    let error = if matches!(code.as_str(), "UNAUTHENTICATED" | "FORBIDDEN")
        || lower.contains("expired token")
        || lower.contains("token expired")
        || lower.contains("invalid token")
        || lower.contains("jwt expired")
    {
        ApiError::Unauthorized(message)
    } else if matches!(code.as_str(), "INTERNAL_SERVER_ERROR" | "SERVICE_UNAVAILABLE")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
    {
        ApiError::Transient(message)
    } else if code == "PERSISTED_QUERY_NOT_FOUND" {
        ApiError::Malformed(format!("persisted query not registered: {}", message))
    } else {
        // Partial data alongside field errors is still usable
        let has_data = operations(body)
            .into_iter()
            .any(|op| op.get("data").is_some_and(|d| !d.is_null()));
        if has_data {
            warn!(%message, "GraphQL response carried field errors");
            return None;
        }
        ApiError::Malformed(message)
    };
    Some(error)
}

fn listing_profile(node: &Value) -> AttendeeProfile {
    AttendeeProfile {
        user_id: text(node, "userId"),
        first_name: text(node, "firstName"),
        last_name: text(node, "lastName"),
        job_title: text(node, "jobTitle"),
        organization: text(node, "organization"),
        biography: text(node, "biography"),
        photo_url: text(node, "photoUrl"),
        ..Default::default()
    }
}

/// Parse one page of `EventPeopleListViewConnectionQuery`
pub fn parse_listing(body: &Value) -> ApiResult<AttendeePage> {
    if let Some(error) = graphql_error(body) {
        return Err(error);
    }

    let people = operations(body)
        .into_iter()
        .find_map(|op| op.pointer("/data/view/people"))
        .filter(|p| p.is_object())
        .ok_or_else(|| ApiError::Malformed("response has no data.view.people".to_string()))?;

    let nodes = people
        .get("nodes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut page = AttendeePage {
        total_count: people.get("totalCount").and_then(Value::as_u64),
        ..Default::default()
    };
    for node in nodes {
        match text(node, "id") {
            Some(id) => page
                .attendees
                .push(AttendeeRecord::shell(id, listing_profile(node), node.clone())),
            None => {
                warn!("Skipping directory entry without an id");
                page.skipped += 1;
            }
        }
    }

    let has_next = people
        .pointer("/pageInfo/hasNextPage")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    page.next_cursor = if has_next {
        people
            .pointer("/pageInfo/endCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    } else {
        None
    };
    Ok(page)
}

/// Which detail column an event question feeds, by its label
fn detail_slot<'a>(detail: &'a mut DetailRecord, label: &str) -> Option<&'a mut Option<String>> {
    let label = label.to_ascii_lowercase();
    let slot = if label.contains("organization type")
        || label.contains("organisation type")
        || label.contains("company type")
    {
        &mut detail.org_type
    } else if label.contains("country") {
        &mut detail.country
    } else if label.contains("province") || label.contains("state") || label.contains("region") {
        &mut detail.province
    } else if label.contains("language") {
        &mut detail.language
    } else if label.contains("industry") || label.contains("sector") {
        &mut detail.industry
    } else if label.contains("position") || label.contains("seniority") {
        &mut detail.position_type
    } else if label.contains("maturity") {
        &mut detail.ai_maturity
    } else if label.contains("category") {
        &mut detail.category
    } else if label.contains("interest") {
        &mut detail.interests
    } else if label.contains("motivation") || label.contains("why are you") {
        &mut detail.motivation
    } else {
        return None;
    };
    Some(slot)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(_) => ["text", "value", "name", "label"]
            .iter()
            .find_map(|key| text(value, key)),
        _ => None,
    }
}

/// Answer of an event question; multi-valued answers are joined with "; "
fn field_answer(field: &Value) -> Option<String> {
    if let Some(values) = field.get("values").and_then(Value::as_array) {
        let parts: Vec<String> = values.iter().filter_map(scalar_text).collect();
        if !parts.is_empty() {
            return Some(parts.join("; "));
        }
    }
    field.get("value").and_then(scalar_text)
}

/// Parse the detail query response for one attendee
pub fn parse_detail(attendee_id: &str, body: &Value) -> ApiResult<DetailRecord> {
    if let Some(error) = graphql_error(body) {
        return Err(error);
    }

    let data = operations(body)
        .into_iter()
        .find_map(|op| op.get("data").filter(|d| d.is_object()))
        .ok_or_else(|| ApiError::Malformed("response has no data".to_string()))?;
    let person = match data.get("person") {
        Some(person) if person.is_object() => person,
        _ => return Err(ApiError::NotFound(attendee_id.to_string())),
    };

    let mut detail = DetailRecord {
        email: text(person, "email"),
        mobile_phone: text(person, "mobilePhone"),
        landline_phone: text(person, "landlinePhone"),
        website_url: text(person, "websiteUrl"),
        raw: person.clone(),
        ..Default::default()
    };

    for network in person
        .get("socialNetworks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let (Some(kind), Some(profile)) = (text(network, "type"), text(network, "profile")) {
            detail.social.set(&kind, profile);
        }
    }

    for field in person
        .pointer("/withEvent/fields")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(label) = field.pointer("/definition/name").and_then(Value::as_str) else {
            continue;
        };
        let Some(answer) = field_answer(field) else {
            continue;
        };
        if let Some(slot) = detail_slot(&mut detail, label) {
            *slot = Some(answer);
        }
    }

    Ok(detail)
}
