use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Severity;

/// Annotation holding the id of the logical occurrence that last wrote a
/// record. A read-back after an ambiguous write compares it to tell whether
/// that write landed.
pub const OCCURRENCE_ANNOTATION: &str = "keelson.io/occurrence";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Set by the API on every write; replaces must echo it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// The object an event is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// A stored event as the API returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub metadata: ObjectMeta,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub severity: Severity,
    pub involved_object: ObjectReference,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    pub count: u32,
    pub reporting_component: String,
    pub reporting_instance: String,
}

/// Events with the same identity fold into one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventIdentity {
    pub reason: String,
    pub involved: ObjectReference,
}

impl EventRecord {
    #[must_use]
    pub fn identity(&self) -> EventIdentity {
        EventIdentity {
            reason: self.reason.clone(),
            involved: self.involved_object.clone(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    #[must_use]
    pub fn occurrence(&self) -> Option<&str> {
        self.metadata.annotations.get(OCCURRENCE_ANNOTATION).map(String::as_str)
    }

    pub fn stamp_occurrence(&mut self, occurrence: &str) {
        self.metadata
            .annotations
            .insert(OCCURRENCE_ANNOTATION.to_string(), occurrence.to_string());
    }

    /// Whether this record was written no longer than `window` before `now`.
    #[must_use]
    pub fn seen_within(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        chrono::Duration::from_std(window)
            .map_or(true, |window| now.signed_duration_since(self.last_timestamp) <= window)
    }

    /// The next write of this record for a repeated occurrence.
    #[must_use]
    pub fn bumped(&self, now: DateTime<Utc>, occurrence: &str) -> Self {
        let mut next = self.clone();
        next.count = self.count.saturating_add(1);
        next.last_timestamp = now;
        next.stamp_occurrence(occurrence);
        next
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
