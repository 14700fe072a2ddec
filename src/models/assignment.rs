//! Intervention assignment model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::InterventionKey;

/// Assignment priority. Critical escalates fastest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Urgent,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Priority::Normal),
            "urgent" => Some(Priority::Urgent),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// A worker's assignment to an intervention.
///
/// Display fields are denormalized copies kept for rendering without a join;
/// the cache never re-derives them. Notification fields drive the escalation
/// state machine and are only ever written upstream; this engine observes
/// them through change events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterventionAssignment {
    pub id: i64,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autonomous_intervention_id: Option<String>,
    pub intervention_label: String,
    pub intervention_ref: String,
    pub worker_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub is_primary: bool,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_planned: Option<String>,
    pub notification_sent: bool,
    pub notification_acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reminder_sent: Option<DateTime<Utc>>,
    pub reminder_count: i64,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InterventionAssignment {
    /// Key of the referenced intervention, or None when the row is malformed.
    pub fn intervention_key(&self) -> Option<InterventionKey> {
        match (self.intervention_id, &self.autonomous_intervention_id) {
            (Some(id), None) => Some(InterventionKey::Numeric(id)),
            (None, Some(auto)) => Some(InterventionKey::Autonomous(auto.clone())),
            _ => None,
        }
    }

    /// An assignment is an open emergency while it is critical and unacknowledged.
    pub fn is_open_emergency(&self) -> bool {
        self.priority == Priority::Critical && !self.notification_acknowledged
    }
}
