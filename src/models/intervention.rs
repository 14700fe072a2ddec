//! Intervention (work order) model.

use serde::{Deserialize, Serialize};

/// Identifier of an intervention.
///
/// A work order carries either a numeric identifier from the system of record
/// or an "autonomous" string identifier, never both. The two spaces are
/// mutually exclusive upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InterventionKey {
    Numeric(i64),
    Autonomous(String),
}

impl std::fmt::Display for InterventionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterventionKey::Numeric(id) => write!(f, "{}", id),
            InterventionKey::Autonomous(id) => write!(f, "{}", id),
        }
    }
}

/// Canonical intervention status as delivered by the system of record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterventionStatus {
    Available,
    Assigned,
    Closed,
    /// Forward-compatibility catch-all; never counted as available.
    #[serde(other)]
    Unknown,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Available => "available",
            InterventionStatus::Assigned => "assigned",
            InterventionStatus::Closed => "closed",
            InterventionStatus::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "available" => InterventionStatus::Available,
            "assigned" => InterventionStatus::Assigned,
            "closed" => InterventionStatus::Closed,
            _ => InterventionStatus::Unknown,
        }
    }
}

/// A field-service intervention (work order).
///
/// Owned exclusively by the cache manager; mutated only by applying a change
/// event or a full refresh. `date_start` stays a raw string on purpose: parsing
/// happens at the point of computation so a malformed date can only exclude the
/// record from a count, never poison the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Intervention {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_id: Option<String>,
    pub tenant_id: String,
    pub ref_code: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_start: Option<String>,
    pub status: InterventionStatus,
}

impl Intervention {
    /// The record's key, or None when the row is malformed (no id, or both ids).
    pub fn key(&self) -> Option<InterventionKey> {
        match (self.id, &self.autonomous_id) {
            (Some(id), None) => Some(InterventionKey::Numeric(id)),
            (None, Some(auto)) => Some(InterventionKey::Autonomous(auto.clone())),
            _ => None,
        }
    }
}
