//! Repository over the system-of-record tables and the change-log outbox.
//!
//! Write helpers mirror what the upstream dispatcher does: every mutation also
//! appends a serialized change event to the outbox, which the polling change
//! source replays to the cache. Reads implement the full-refresh fetch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;

use crate::cache::RefreshPayload;
use crate::errors::AppError;
use crate::models::{
    ChangeEvent, ChangeOp, ChangeTable, Intervention, InterventionAssignment, InterventionKey,
    InterventionStatus, Priority, RecordKey,
};
use crate::stream::{ChangeSource, SnapshotSource};

/// Database repository for refresh fetches and outbox maintenance.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ==================== INTERVENTION OPERATIONS ====================

    /// List all interventions for a tenant.
    pub async fn list_interventions(&self, tenant_id: &str) -> Result<Vec<Intervention>, AppError> {
        let rows = sqlx::query(
            "SELECT numeric_id, autonomous_id, tenant_id, ref_code, label, date_start, status \
             FROM interventions WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(intervention_from_row).collect())
    }

    /// Insert or replace an intervention and append the change to the outbox.
    pub async fn upsert_intervention(&self, row: &Intervention) -> Result<(), AppError> {
        let key = row
            .key()
            .ok_or_else(|| AppError::Validation("Intervention needs exactly one id".to_string()))?;

        let existing = sqlx::query("SELECT key FROM interventions WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let op = if existing.is_some() {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };

        sqlx::query(
            "INSERT OR REPLACE INTO interventions \
             (key, numeric_id, autonomous_id, tenant_id, ref_code, label, date_start, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(key.to_string())
        .bind(row.id)
        .bind(&row.autonomous_id)
        .bind(&row.tenant_id)
        .bind(&row.ref_code)
        .bind(&row.label)
        .bind(&row.date_start)
        .bind(row.status.as_str())
        .execute(&self.pool)
        .await?;

        self.log_change(ChangeEvent::upsert_intervention(op, row.clone(), Utc::now()))
            .await
    }

    /// Delete an intervention and append the change to the outbox.
    pub async fn delete_intervention(
        &self,
        tenant_id: &str,
        key: &InterventionKey,
    ) -> Result<(), AppError> {
        sqlx::query("DELETE FROM interventions WHERE key = ? AND tenant_id = ?")
            .bind(key.to_string())
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        self.log_change(ChangeEvent::delete(
            ChangeTable::Interventions,
            tenant_id,
            RecordKey::Intervention(key.clone()),
            Utc::now(),
        ))
        .await
    }

    // ==================== ASSIGNMENT OPERATIONS ====================

    /// List all assignments for a tenant.
    pub async fn list_assignments(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<InterventionAssignment>, AppError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, intervention_id, autonomous_intervention_id, \
             intervention_label, intervention_ref, worker_name, client_name, location, \
             is_primary, priority, date_planned, notification_sent, notification_acknowledged, \
             acknowledged_at, last_reminder_sent, reminder_count, assigned_by, assigned_at, \
             created_at, updated_at \
             FROM assignments WHERE tenant_id = ?",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let mut assignments = Vec::with_capacity(rows.len());
        for row in &rows {
            match assignment_from_row(row) {
                Ok(assignment) => assignments.push(assignment),
                Err(err) => tracing::warn!("Skipping malformed assignment row: {}", err),
            }
        }
        Ok(assignments)
    }

    /// Insert or replace an assignment and append the change to the outbox.
    pub async fn upsert_assignment(&self, row: &InterventionAssignment) -> Result<(), AppError> {
        let existing = sqlx::query("SELECT id FROM assignments WHERE id = ?")
            .bind(row.id)
            .fetch_optional(&self.pool)
            .await?;
        let op = if existing.is_some() {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };

        sqlx::query(
            "INSERT OR REPLACE INTO assignments \
             (id, tenant_id, intervention_id, autonomous_intervention_id, intervention_label, \
              intervention_ref, worker_name, client_name, location, is_primary, priority, \
              date_planned, notification_sent, notification_acknowledged, acknowledged_at, \
              last_reminder_sent, reminder_count, assigned_by, assigned_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id)
        .bind(&row.tenant_id)
        .bind(row.intervention_id)
        .bind(&row.autonomous_intervention_id)
        .bind(&row.intervention_label)
        .bind(&row.intervention_ref)
        .bind(&row.worker_name)
        .bind(&row.client_name)
        .bind(&row.location)
        .bind(row.is_primary)
        .bind(row.priority.as_str())
        .bind(&row.date_planned)
        .bind(row.notification_sent)
        .bind(row.notification_acknowledged)
        .bind(row.acknowledged_at.map(|t| t.to_rfc3339()))
        .bind(row.last_reminder_sent.map(|t| t.to_rfc3339()))
        .bind(row.reminder_count)
        .bind(&row.assigned_by)
        .bind(row.assigned_at.to_rfc3339())
        .bind(row.created_at.to_rfc3339())
        .bind(row.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.log_change(ChangeEvent::upsert_assignment(op, row.clone(), Utc::now()))
            .await
    }

    /// Delete an assignment and append the change to the outbox.
    pub async fn delete_assignment(&self, tenant_id: &str, id: i64) -> Result<(), AppError> {
        sqlx::query("DELETE FROM assignments WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        self.log_change(ChangeEvent::delete(
            ChangeTable::Assignments,
            tenant_id,
            RecordKey::Assignment(id),
            Utc::now(),
        ))
        .await
    }

    // ==================== CHANGE LOG ====================

    /// Append a change event to the outbox.
    pub async fn log_change(&self, event: ChangeEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(&event)?;
        sqlx::query("INSERT INTO change_log (tenant_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(&event.tenant_id)
            .bind(payload)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Highest outbox sequence number for a tenant (0 when empty).
    pub async fn latest_change_seq(&self, tenant_id: &str) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM change_log WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("seq"))
    }

    /// Outbox entries after a sequence number, oldest first.
    pub async fn fetch_changes_after(
        &self,
        tenant_id: &str,
        after_seq: i64,
    ) -> Result<Vec<(i64, ChangeEvent)>, AppError> {
        let rows = sqlx::query(
            "SELECT seq, payload FROM change_log WHERE tenant_id = ? AND seq > ? ORDER BY seq",
        )
        .bind(tenant_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.get("seq");
            let payload: String = row.get("payload");
            match serde_json::from_str(&payload) {
                Ok(event) => events.push((seq, event)),
                Err(err) => tracing::warn!(seq, "Skipping unreadable outbox entry: {}", err),
            }
        }
        Ok(events)
    }
}

impl SnapshotSource for Repository {
    async fn fetch_all(&self, tenant_id: &str) -> Result<RefreshPayload, AppError> {
        let fetched_at = Utc::now();
        let interventions = self.list_interventions(tenant_id).await?;
        let assignments = self.list_assignments(tenant_id).await?;
        Ok(RefreshPayload {
            tenant_id: tenant_id.to_string(),
            interventions,
            assignments,
            fetched_at,
        })
    }
}

/// Change source that replays the outbox at a fixed poll interval.
///
/// Only entries appended after subscription are delivered; everything earlier
/// is covered by the mandatory full refresh. A poll failure closes the
/// receiver, which makes the sync service resubscribe with backoff.
pub struct PollingChangeSource {
    repo: Repository,
    interval: Duration,
}

impl PollingChangeSource {
    pub fn new(repo: Repository, interval: Duration) -> Self {
        Self { repo, interval }
    }
}

impl ChangeSource for PollingChangeSource {
    async fn subscribe(&self, tenant_id: &str) -> Result<mpsc::Receiver<ChangeEvent>, AppError> {
        let mut cursor = self
            .repo
            .latest_change_seq(tenant_id)
            .await
            .map_err(|err| AppError::Transport(format!("outbox cursor unavailable: {err}")))?;
        let (tx, rx) = mpsc::channel(64);
        let repo = self.repo.clone();
        let interval = self.interval;
        let tenant = tenant_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match repo.fetch_changes_after(&tenant, cursor).await {
                    Ok(batch) => {
                        for (seq, event) in batch {
                            cursor = cursor.max(seq);
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(tenant = %tenant, "Outbox poll failed: {}", err);
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn intervention_from_row(row: &sqlx::sqlite::SqliteRow) -> Intervention {
    let status: String = row.get("status");
    Intervention {
        id: row.get("numeric_id"),
        autonomous_id: row.get("autonomous_id"),
        tenant_id: row.get("tenant_id"),
        ref_code: row.get("ref_code"),
        label: row.get("label"),
        date_start: row.get("date_start"),
        status: InterventionStatus::from_str(&status),
    }
}

fn assignment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<InterventionAssignment, AppError> {
    let priority: String = row.get("priority");
    let priority = Priority::from_str(&priority)
        .ok_or_else(|| AppError::MalformedRecord(format!("Unknown priority {:?}", priority)))?;

    Ok(InterventionAssignment {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        intervention_id: row.get("intervention_id"),
        autonomous_intervention_id: row.get("autonomous_intervention_id"),
        intervention_label: row.get("intervention_label"),
        intervention_ref: row.get("intervention_ref"),
        worker_name: row.get("worker_name"),
        client_name: row.get("client_name"),
        location: row.get("location"),
        is_primary: row.get("is_primary"),
        priority,
        date_planned: row.get("date_planned"),
        notification_sent: row.get("notification_sent"),
        notification_acknowledged: row.get("notification_acknowledged"),
        acknowledged_at: parse_opt_ts(row.get("acknowledged_at"))?,
        last_reminder_sent: parse_opt_ts(row.get("last_reminder_sent"))?,
        reminder_count: row.get("reminder_count"),
        assigned_by: row.get("assigned_by"),
        assigned_at: parse_ts(row.get("assigned_at"))?,
        created_at: parse_ts(row.get("created_at"))?,
        updated_at: parse_ts(row.get("updated_at"))?,
    })
}

fn parse_ts(raw: String) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| AppError::MalformedRecord(format!("Bad timestamp {:?}: {}", raw, err)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    raw.map(parse_ts).transpose()
}
