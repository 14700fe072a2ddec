//! Derived urgent-notification projection.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{InterventionAssignment, Priority};

/// Transient projection of an assignment for the urgent list.
///
/// Never persisted; recomputed on every read from the current snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgentNotification {
    pub assignment_id: i64,
    pub intervention_label: String,
    pub intervention_ref: String,
    pub worker_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub priority: Priority,
    pub assigned_at: DateTime<Utc>,
    pub reminder_count: i64,
    /// Sent, unacknowledged, and no reminder dispatched yet.
    pub is_new: bool,
    /// A reminder was sent more recently than the original notification.
    pub is_reminder: bool,
}

impl UrgentNotification {
    pub fn project(assignment: &InterventionAssignment) -> Self {
        let is_new = assignment.notification_sent
            && !assignment.notification_acknowledged
            && assignment.last_reminder_sent.is_none();
        let is_reminder = assignment.last_reminder_sent.is_some();

        Self {
            assignment_id: assignment.id,
            intervention_label: assignment.intervention_label.clone(),
            intervention_ref: assignment.intervention_ref.clone(),
            worker_name: assignment.worker_name.clone(),
            client_name: assignment.client_name.clone(),
            location: assignment.location.clone(),
            priority: assignment.priority,
            assigned_at: assignment.assigned_at,
            reminder_count: assignment.reminder_count,
            is_new,
            is_reminder,
        }
    }
}
