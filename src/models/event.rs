//! Change events delivered by the push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Intervention, InterventionAssignment, InterventionKey};

/// Table affected by a change event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTable {
    Interventions,
    Assignments,
}

/// Change operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Key of any cached record, across both tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKey {
    Intervention(InterventionKey),
    Assignment(i64),
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Intervention(key) => write!(f, "intervention/{}", key),
            RecordKey::Assignment(id) => write!(f, "assignment/{}", id),
        }
    }
}

/// A single row-level change, as delivered by the change stream.
///
/// Delivery is at-least-once and may reorder relative to a prior full fetch;
/// the cache resolves conflicts with the server timestamp, never arrival order.
/// Insert and update carry the full new row; delete carries only the key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub op: ChangeOp,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention: Option<Intervention>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment: Option<InterventionAssignment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_key: Option<RecordKey>,
    pub server_ts: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn upsert_intervention(op: ChangeOp, row: Intervention, server_ts: DateTime<Utc>) -> Self {
        Self {
            table: ChangeTable::Interventions,
            op,
            tenant_id: row.tenant_id.clone(),
            intervention: Some(row),
            assignment: None,
            deleted_key: None,
            server_ts,
        }
    }

    pub fn upsert_assignment(
        op: ChangeOp,
        row: InterventionAssignment,
        server_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            table: ChangeTable::Assignments,
            op,
            tenant_id: row.tenant_id.clone(),
            intervention: None,
            assignment: Some(row),
            deleted_key: None,
            server_ts,
        }
    }

    pub fn delete(
        table: ChangeTable,
        tenant_id: &str,
        key: RecordKey,
        server_ts: DateTime<Utc>,
    ) -> Self {
        Self {
            table,
            op: ChangeOp::Delete,
            tenant_id: tenant_id.to_string(),
            intervention: None,
            assignment: None,
            deleted_key: Some(key),
            server_ts,
        }
    }

    /// Key of the affected record. None means the event is malformed
    /// (upsert without a row, delete without a key, row without a usable id).
    pub fn key(&self) -> Option<RecordKey> {
        match self.op {
            ChangeOp::Delete => self.deleted_key.clone(),
            ChangeOp::Insert | ChangeOp::Update => match self.table {
                ChangeTable::Interventions => self
                    .intervention
                    .as_ref()
                    .and_then(|row| row.key())
                    .map(RecordKey::Intervention),
                ChangeTable::Assignments => {
                    self.assignment.as_ref().map(|row| RecordKey::Assignment(row.id))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InterventionStatus;
    use chrono::TimeZone;

    #[test]
    fn test_event_key_derivation() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let row = Intervention {
            id: Some(7),
            autonomous_id: None,
            tenant_id: "acme".to_string(),
            ref_code: "INT-7".to_string(),
            label: "x".to_string(),
            date_start: None,
            status: InterventionStatus::Available,
        };

        let upsert = ChangeEvent::upsert_intervention(ChangeOp::Insert, row, ts);
        assert_eq!(
            upsert.key(),
            Some(RecordKey::Intervention(InterventionKey::Numeric(7)))
        );

        let delete = ChangeEvent::delete(
            ChangeTable::Assignments,
            "acme",
            RecordKey::Assignment(3),
            ts,
        );
        assert_eq!(delete.key(), Some(RecordKey::Assignment(3)));

        let malformed = ChangeEvent {
            deleted_key: None,
            ..delete
        };
        assert_eq!(malformed.key(), None);
    }
}
