//! Notification escalation engine.
//!
//! Tracks each assignment's notification lifecycle (Pending, Notified,
//! Acknowledged) and evaluates reminder cadence on a periodic tick. The
//! engine never sends anything: it emits reminder-due signals to the delivery
//! collaborator and infers delivery success from the next observed state
//! (an acknowledgment or a fresh `last_reminder_sent`), so an unserviced
//! signal is simply re-emitted on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheManager, DiffSummary, Snapshot};
use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::models::{InterventionAssignment, Priority, RecordKey, UrgentNotification};

/// Notification lifecycle state, derived from the assignment's record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    /// Created, notification not yet sent.
    Pending,
    /// Sent, unacknowledged; reminder evaluation applies.
    Notified,
    /// Terminal; no further reminder evaluation.
    Acknowledged,
}

impl NotificationState {
    fn of(row: &InterventionAssignment) -> Self {
        if row.notification_acknowledged {
            NotificationState::Acknowledged
        } else if row.notification_sent {
            NotificationState::Notified
        } else {
            NotificationState::Pending
        }
    }
}

/// Reminder-due signal handed to the delivery collaborator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSignal {
    pub assignment_id: i64,
    pub priority: Priority,
    pub reminder_count: i64,
}

/// Priority-dependent reminder thresholds. `normal: None` means normal
/// priority never reminds.
#[derive(Debug, Clone, Copy)]
pub struct ReminderPolicy {
    pub critical: Duration,
    pub urgent: Duration,
    pub normal: Option<Duration>,
}

impl ReminderPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            critical: config.reminder_critical,
            urgent: config.reminder_urgent,
            normal: config.reminder_normal,
        }
    }

    fn threshold(&self, priority: Priority) -> Option<Duration> {
        match priority {
            Priority::Critical => Some(self.critical),
            Priority::Urgent => Some(self.urgent),
            Priority::Normal => self.normal,
        }
    }
}

/// Per-assignment escalation tracking and reminder evaluation.
pub struct EscalationEngine {
    cache: Arc<CacheManager>,
    policy: ReminderPolicy,
    diagnostics: Arc<Diagnostics>,
    states: Mutex<HashMap<i64, NotificationState>>,
    /// Interventions already counted for a duplicate-primary violation, so a
    /// persistent violation inflates the diagnostics counter once, not once
    /// per read.
    flagged_primaries: Mutex<HashSet<String>>,
    signals: mpsc::UnboundedSender<ReminderSignal>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl EscalationEngine {
    /// Build the engine and the receiving end of the reminder-due channel.
    pub fn new(
        cache: Arc<CacheManager>,
        policy: ReminderPolicy,
        diagnostics: Arc<Diagnostics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ReminderSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            cache,
            policy,
            diagnostics,
            states: Mutex::new(HashMap::new()),
            flagged_primaries: Mutex::new(HashSet::new()),
            signals: tx,
            ticker: Mutex::new(None),
        });
        (engine, rx)
    }

    /// Register on the cache to observe state transitions through change events.
    pub fn attach(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        self.cache.on_change(Box::new(move |_revision, snapshot, diff| {
            engine.on_cache_change(snapshot, diff);
        }));
    }

    fn on_cache_change(&self, snapshot: &Arc<Snapshot>, diff: &DiffSummary) {
        let mut states = self.states.lock().expect("escalation state lock poisoned");

        if diff.is_empty() {
            // Registration or an idempotent re-apply; resync the whole map.
            states.retain(|id, _| snapshot.assignments.contains_key(id));
            for (id, row) in &snapshot.assignments {
                states.entry(*id).or_insert_with(|| NotificationState::of(row));
            }
            return;
        }

        for key in diff.added.iter().chain(diff.updated.iter()) {
            let RecordKey::Assignment(id) = key else {
                continue;
            };
            let Some(row) = snapshot.assignments.get(id) else {
                continue;
            };
            let next = NotificationState::of(row);
            match states.insert(*id, next) {
                Some(prev) if prev != next => {
                    tracing::info!(
                        assignment = *id,
                        "Notification state {:?} -> {:?}",
                        prev,
                        next
                    );
                }
                None => {
                    tracing::debug!(assignment = *id, "Tracking assignment in {:?}", next);
                }
                _ => {}
            }
        }

        for key in &diff.removed {
            if let RecordKey::Assignment(id) = key {
                // Unassignment or intervention closure; not an error.
                if states.remove(id).is_some() {
                    tracing::debug!(assignment = *id, "Dropped from escalation tracking");
                }
            }
        }
    }

    /// Reminder evaluation against a snapshot at `now`.
    ///
    /// Only assignments whose tracked lifecycle state is Notified are
    /// evaluated; a row never observed through the cache is skipped. A
    /// Notified assignment is due when the elapsed time since
    /// `last_reminder_sent` (or `assigned_at` if no reminder was sent yet)
    /// exceeds its priority threshold. Exactly one signal per due assignment
    /// per evaluation.
    pub fn evaluate_due_at(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<ReminderSignal> {
        let states = self.states.lock().expect("escalation state lock poisoned");
        let mut due: Vec<ReminderSignal> = snapshot
            .assignments
            .values()
            .filter(|row| states.get(&row.id) == Some(&NotificationState::Notified))
            .filter_map(|row| {
                let threshold = self.policy.threshold(row.priority)?;
                let threshold = chrono::Duration::from_std(threshold).ok()?;
                let anchor = row.last_reminder_sent.unwrap_or(row.assigned_at);
                if now.signed_duration_since(anchor) > threshold {
                    Some(ReminderSignal {
                        assignment_id: row.id,
                        priority: row.priority,
                        reminder_count: row.reminder_count,
                    })
                } else {
                    None
                }
            })
            .collect();
        due.sort_by_key(|signal| signal.assignment_id);
        due
    }

    /// One reminder evaluation pass: read the snapshot, emit due signals.
    pub fn tick(&self) {
        let (snapshot, _) = self.cache.snapshot();
        let due = self.evaluate_due_at(&snapshot, Utc::now());
        for signal in due {
            tracing::info!(
                assignment = signal.assignment_id,
                priority = signal.priority.as_str(),
                reminder_count = signal.reminder_count,
                "Reminder due"
            );
            if self.signals.send(signal).is_err() {
                tracing::warn!("Reminder channel closed; dropping signal");
                return;
            }
        }
    }

    /// Spawn the periodic evaluation task. Replaces any previous ticker.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.ticker.lock().expect("ticker lock poisoned");
        if let Some(handle) = guard.take() {
            handle.abort();
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.tick();
            }
        });
        *guard = Some(handle);
    }

    /// Stop the periodic evaluation task.
    pub fn stop(&self) {
        if let Some(handle) = self.ticker.lock().expect("ticker lock poisoned").take() {
            handle.abort();
        }
    }

    /// Urgent-notification projections for the presentation layer, ordered by
    /// `assigned_at` descending. Validates the one-primary-per-intervention
    /// invariant on the way through.
    pub fn list_urgent_notifications(&self) -> Vec<UrgentNotification> {
        let (snapshot, _) = self.cache.snapshot();
        self.validate_primaries(&snapshot);

        let mut rows: Vec<&InterventionAssignment> = snapshot
            .assignments
            .values()
            .filter(|row| {
                matches!(row.priority, Priority::Urgent | Priority::Critical)
                    && row.notification_sent
                    && !row.notification_acknowledged
            })
            .collect();
        rows.sort_by(|a, b| b.assigned_at.cmp(&a.assigned_at));
        rows.into_iter().map(UrgentNotification::project).collect()
    }

    /// The upstream store guarantees at most one primary assignment per
    /// intervention. A violation is warned about and counted once per
    /// intervention for as long as it persists; computation proceeds with the
    /// most-recently-updated one.
    fn validate_primaries(&self, snapshot: &Snapshot) {
        let mut primaries: HashMap<String, &InterventionAssignment> = HashMap::new();
        let mut violations: HashSet<String> = HashSet::new();
        for row in snapshot.assignments.values().filter(|row| row.is_primary) {
            let Some(key) = row.intervention_key() else {
                continue;
            };
            let key = key.to_string();
            if let Some(existing) = primaries.get(&key) {
                tracing::debug!(
                    intervention = %key,
                    "Two primary assignments observed ({} and {}), using most recently updated",
                    existing.id,
                    row.id
                );
                violations.insert(key.clone());
                if row.updated_at > existing.updated_at {
                    primaries.insert(key, row);
                }
            } else {
                primaries.insert(key, row);
            }
        }

        let mut flagged = self
            .flagged_primaries
            .lock()
            .expect("primary flag lock poisoned");
        for key in violations.difference(&flagged) {
            self.diagnostics.record_inconsistency();
            tracing::warn!(intervention = %key, "Duplicate primary assignment");
        }
        *flagged = violations;
    }
}
