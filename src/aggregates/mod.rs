//! Derived aggregate counters.
//!
//! Three counters computed from the cache snapshot plus the override store:
//! available interventions, interventions scheduled today, open emergencies.
//! They are recomputed synchronously inside the cache's change listener, so a
//! reader observing revision N always sees counts consistent with revision N.
//! The diff summary gives a cheap skip when a mutation cannot affect a
//! counter; otherwise a full predicate scan runs. The tenant working set is
//! bounded and the scan is cheap next to network latency.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::cache::{CacheManager, DiffSummary, Snapshot};
use crate::diagnostics::Diagnostics;
use crate::overrides::OverrideStore;

/// Source of "today" for the day-window computation. Injectable for tests.
///
/// Day boundaries are evaluated in UTC against the canonical server
/// timestamps; a presentation-layer timezone can be threaded in here.
pub type TodaySource = Box<dyn Fn() -> NaiveDate + Send + Sync>;

/// The three derived counts at one revision.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counts {
    pub available: u64,
    pub today: u64,
    pub open_emergency: u64,
}

#[derive(Default)]
struct CountState {
    counts: Counts,
    revision: i64,
    /// Records already counted as malformed, so a bad date inflates the
    /// diagnostics counter once, not once per recomputation.
    malformed_dates: HashSet<String>,
}

/// Incremental counter engine over the cache snapshot.
pub struct AggregateEngine {
    overrides: Arc<OverrideStore>,
    diagnostics: Arc<Diagnostics>,
    state: RwLock<CountState>,
    today: TodaySource,
}

impl AggregateEngine {
    pub fn new(overrides: Arc<OverrideStore>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            overrides,
            diagnostics,
            state: RwLock::new(CountState::default()),
            today: Box::new(|| Utc::now().date_naive()),
        }
    }

    /// Replace the "today" source. Test hook.
    pub fn with_today_source(mut self, today: TodaySource) -> Self {
        self.today = today;
        self
    }

    /// Register this engine on the cache so every applied mutation recomputes
    /// the counters before the apply returns.
    pub fn attach(self: &Arc<Self>, cache: &CacheManager) {
        let engine = Arc::clone(self);
        cache.on_change(Box::new(move |revision, snapshot, diff| {
            engine.on_cache_change(revision, snapshot, diff);
        }));
    }

    fn on_cache_change(&self, revision: i64, snapshot: &Arc<Snapshot>, diff: &DiffSummary) {
        let mut guard = self.state.write().expect("aggregate state lock poisoned");
        let state = &mut *guard;

        let recompute_interventions = diff.is_empty() || diff.touches_interventions();
        let recompute_assignments = diff.is_empty() || diff.touches_assignments();

        if recompute_interventions {
            state.counts.available = snapshot
                .interventions
                .values()
                .filter(|row| row.status == crate::models::InterventionStatus::Available)
                .count() as u64;
            state.counts.today = self.count_today(snapshot, &mut state.malformed_dates);
        }
        if recompute_assignments {
            state.counts.open_emergency = snapshot
                .assignments
                .values()
                .filter(|row| row.is_open_emergency())
                .count() as u64;
        }
        state.revision = revision;
    }

    /// Force a full recomputation from the current snapshot. Used when the
    /// override store changes, which the cache cannot observe.
    pub fn recompute_from(&self, cache: &CacheManager) {
        let (snapshot, revision) = cache.snapshot();
        self.on_cache_change(revision, &snapshot, &DiffSummary::default());
    }

    /// Count interventions whose effective date falls on today.
    ///
    /// Effective date = override value when present, else `date_start`.
    /// Absent dates exclude the record silently; unparseable dates exclude it
    /// and bump the malformed counter once per record, cleared again when the
    /// record is corrected or disappears. A display-layer value must never
    /// crash a background count.
    fn count_today(&self, snapshot: &Snapshot, flagged: &mut HashSet<String>) -> u64 {
        let today = (self.today)();
        let mut malformed = HashSet::new();
        let mut count = 0u64;

        for row in snapshot.interventions.values() {
            let key = row.key();
            let raw = match key.as_ref().and_then(|k| self.overrides.get(k)) {
                Some(override_value) => override_value,
                None => match row.date_start.clone() {
                    Some(raw) => raw,
                    None => continue,
                },
            };
            match parse_event_date(&raw) {
                Some(date) if date == today => count += 1,
                Some(_) => {}
                None => {
                    let id = key.map(|k| k.to_string()).unwrap_or_default();
                    tracing::debug!(
                        "Unparseable date {:?} on intervention {}, excluded from today count",
                        raw,
                        id
                    );
                    malformed.insert(id);
                }
            }
        }

        for id in malformed.difference(flagged) {
            self.diagnostics.record_malformed();
            tracing::warn!(intervention = %id, "Date unparseable, excluded from today count");
        }
        *flagged = malformed;

        count
    }

    pub fn counts(&self) -> Counts {
        self.state.read().expect("aggregate state lock poisoned").counts
    }

    pub fn available_count(&self) -> u64 {
        self.counts().available
    }

    pub fn today_count(&self) -> u64 {
        self.counts().today
    }

    pub fn open_emergency_count(&self) -> u64 {
        self.counts().open_emergency
    }

    /// Revision the current counts were computed against.
    pub fn revision(&self) -> i64 {
        self.state.read().expect("aggregate state lock poisoned").revision
    }
}

/// Parse a date value as delivered by the store or the override UI:
/// RFC3339 timestamps (evaluated as their UTC date) or plain `YYYY-MM-DD`.
pub(crate) fn parse_event_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc().date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RefreshPayload;
    use crate::models::{
        ChangeEvent, ChangeOp, ChangeTable, Intervention, InterventionAssignment, InterventionKey,
        InterventionStatus, Priority, RecordKey,
    };
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    fn intervention(id: i64, status: InterventionStatus, date_start: Option<&str>) -> Intervention {
        Intervention {
            id: Some(id),
            autonomous_id: None,
            tenant_id: "acme".to_string(),
            ref_code: format!("INT-{id}"),
            label: format!("Job {id}"),
            date_start: date_start.map(str::to_string),
            status,
        }
    }

    fn assignment(id: i64, priority: Priority, acknowledged: bool) -> InterventionAssignment {
        let t = ts(9);
        InterventionAssignment {
            id,
            tenant_id: "acme".to_string(),
            intervention_id: Some(id),
            autonomous_intervention_id: None,
            intervention_label: format!("Job {id}"),
            intervention_ref: format!("INT-{id}"),
            worker_name: "Dana".to_string(),
            client_name: None,
            location: None,
            is_primary: true,
            priority,
            date_planned: None,
            notification_sent: true,
            notification_acknowledged: acknowledged,
            acknowledged_at: None,
            last_reminder_sent: None,
            reminder_count: 0,
            assigned_by: "dispatch".to_string(),
            assigned_at: t,
            created_at: t,
            updated_at: t,
        }
    }

    fn engine_on(
        cache: &CacheManager,
        overrides: Arc<OverrideStore>,
        today: NaiveDate,
    ) -> Arc<AggregateEngine> {
        let engine = Arc::new(
            AggregateEngine::new(overrides, Arc::new(Diagnostics::default()))
                .with_today_source(Box::new(move || today)),
        );
        engine.attach(cache);
        engine
    }

    #[test]
    fn test_available_count_end_to_end() {
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(
            &cache,
            Arc::new(OverrideStore::in_memory()),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );

        cache.apply_full_refresh(RefreshPayload {
            tenant_id: "acme".to_string(),
            interventions: vec![
                intervention(1, InterventionStatus::Available, None),
                intervention(2, InterventionStatus::Available, None),
                intervention(3, InterventionStatus::Available, None),
            ],
            assignments: Vec::new(),
            fetched_at: ts(8),
        }).unwrap();
        assert_eq!(engine.available_count(), 3);

        cache.apply_change_event(ChangeEvent::delete(
            ChangeTable::Interventions,
            "acme",
            RecordKey::Intervention(InterventionKey::Numeric(2)),
            ts(9),
        ));
        assert_eq!(engine.available_count(), 2);

        cache.apply_change_event(ChangeEvent::upsert_intervention(
            ChangeOp::Insert,
            intervention(4, InterventionStatus::Available, None),
            ts(10),
        ));
        assert_eq!(engine.available_count(), 3);
    }

    #[test]
    fn test_today_count_respects_override() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let overrides = Arc::new(OverrideStore::in_memory());
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(&cache, Arc::clone(&overrides), today);

        cache.apply_full_refresh(RefreshPayload {
            tenant_id: "acme".to_string(),
            interventions: vec![intervention(
                1,
                InterventionStatus::Assigned,
                Some("2024-01-01T10:00:00Z"),
            )],
            assignments: Vec::new(),
            fetched_at: ts(8),
        }).unwrap();
        assert_eq!(engine.today_count(), 1, "dateStart falls on today");

        // The override beats the canonical value without mutating the cache.
        overrides.set(&InterventionKey::Numeric(1), "2024-01-02".to_string());
        engine.recompute_from(&cache);
        assert_eq!(engine.today_count(), 0, "override moves it off today");

        overrides.clear(&InterventionKey::Numeric(1));
        engine.recompute_from(&cache);
        assert_eq!(engine.today_count(), 1);
    }

    #[test]
    fn test_unparseable_dates_excluded_silently() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(&cache, Arc::new(OverrideStore::in_memory()), today);

        cache.apply_full_refresh(RefreshPayload {
            tenant_id: "acme".to_string(),
            interventions: vec![
                intervention(1, InterventionStatus::Assigned, Some("not a date")),
                intervention(2, InterventionStatus::Assigned, None),
                intervention(3, InterventionStatus::Assigned, Some("2024-01-01")),
            ],
            assignments: Vec::new(),
            fetched_at: ts(8),
        }).unwrap();

        assert_eq!(engine.today_count(), 1);
    }

    #[test]
    fn test_malformed_date_counted_once_per_record() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let diag = Arc::new(Diagnostics::default());
        let cache = CacheManager::new("acme", Arc::clone(&diag));
        let engine = Arc::new(
            AggregateEngine::new(Arc::new(OverrideStore::in_memory()), Arc::clone(&diag))
                .with_today_source(Box::new(move || today)),
        );
        engine.attach(&cache);

        cache
            .apply_full_refresh(RefreshPayload {
                tenant_id: "acme".to_string(),
                interventions: vec![intervention(1, InterventionStatus::Assigned, Some("soon"))],
                assignments: Vec::new(),
                fetched_at: ts(8),
            })
            .unwrap();
        assert_eq!(diag.report().malformed_records, 1);

        // Recomputations over the same record are the same observation.
        engine.recompute_from(&cache);
        engine.recompute_from(&cache);
        assert_eq!(diag.report().malformed_records, 1);

        // A corrected date clears the flag; going bad again is a new one.
        cache.apply_change_event(ChangeEvent::upsert_intervention(
            ChangeOp::Update,
            intervention(1, InterventionStatus::Assigned, Some("2024-01-01")),
            ts(9),
        ));
        assert_eq!(engine.today_count(), 1);
        assert_eq!(diag.report().malformed_records, 1);

        cache.apply_change_event(ChangeEvent::upsert_intervention(
            ChangeOp::Update,
            intervention(1, InterventionStatus::Assigned, Some("soon")),
            ts(10),
        ));
        assert_eq!(diag.report().malformed_records, 2);
    }

    #[test]
    fn test_emergency_count_tracks_acknowledgment() {
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(
            &cache,
            Arc::new(OverrideStore::in_memory()),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );

        cache.apply_change_event(ChangeEvent::upsert_assignment(
            ChangeOp::Insert,
            assignment(1, Priority::Critical, false),
            ts(9),
        ));
        assert_eq!(engine.open_emergency_count(), 1);

        // Acknowledgment arrives as a change event; the count drops
        // synchronously with the apply.
        let mut acked = assignment(1, Priority::Critical, true);
        acked.updated_at = ts(10);
        cache.apply_change_event(ChangeEvent::upsert_assignment(
            ChangeOp::Update,
            acked,
            ts(10),
        ));
        assert_eq!(engine.open_emergency_count(), 0);
    }

    #[test]
    fn test_urgent_is_not_an_emergency() {
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(
            &cache,
            Arc::new(OverrideStore::in_memory()),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );

        cache.apply_change_event(ChangeEvent::upsert_assignment(
            ChangeOp::Insert,
            assignment(1, Priority::Urgent, false),
            ts(9),
        ));
        assert_eq!(engine.open_emergency_count(), 0);
    }

    #[test]
    fn test_counts_follow_cache_revision() {
        let cache = CacheManager::new("acme", Arc::new(Diagnostics::default()));
        let engine = engine_on(
            &cache,
            Arc::new(OverrideStore::in_memory()),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );

        cache.apply_change_event(ChangeEvent::upsert_intervention(
            ChangeOp::Insert,
            intervention(1, InterventionStatus::Available, None),
            ts(9),
        ));

        assert_eq!(engine.revision(), cache.revision());
    }
}
