//! Tenant-scoped snapshot cache.
//!
//! The cache manager owns the authoritative local snapshot of intervention and
//! assignment records for the active tenant. It is the single writer: change
//! events and full refreshes are serialized through one mutex, while readers
//! share immutable `Arc<Snapshot>` values and never observe a partially
//! applied event.
//!
//! Conflict rules:
//! - upserts resolve last-writer-wins on the event's server timestamp, never
//!   arrival order;
//! - a delete is terminal for its key until the next full refresh (tombstone),
//!   regardless of arrival order;
//! - an event older than the last full refresh is already reflected in the
//!   refreshed data and is discarded as superseded;
//! - an event or refresh for a non-active tenant is discarded and counted;
//!   `set_active_tenant` is the only tenant handover point.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::diagnostics::Diagnostics;
use crate::errors::AppError;
use crate::models::{
    ChangeEvent, ChangeOp, Intervention, InterventionAssignment, InterventionKey, RecordKey,
};

/// Immutable view of the cached records for one tenant.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tenant_id: String,
    pub interventions: HashMap<InterventionKey, Intervention>,
    pub assignments: HashMap<i64, InterventionAssignment>,
}

impl Snapshot {
    pub fn empty(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            interventions: HashMap::new(),
            assignments: HashMap::new(),
        }
    }
}

/// Identifiers touched by one applied mutation.
#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    pub added: Vec<RecordKey>,
    pub updated: Vec<RecordKey>,
    pub removed: Vec<RecordKey>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
    }

    /// Whether any touched key belongs to the interventions table.
    pub fn touches_interventions(&self) -> bool {
        self.keys()
            .any(|key| matches!(key, RecordKey::Intervention(_)))
    }

    /// Whether any touched key belongs to the assignments table.
    pub fn touches_assignments(&self) -> bool {
        self.keys().any(|key| matches!(key, RecordKey::Assignment(_)))
    }
}

/// Full tenant dataset as fetched from the system of record.
#[derive(Debug, Clone)]
pub struct RefreshPayload {
    pub tenant_id: String,
    pub interventions: Vec<Intervention>,
    pub assignments: Vec<InterventionAssignment>,
    /// Server-side time the fetch reflects; events older than this are superseded.
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of applying a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Event accepted; carries the new revision.
    Applied(i64),
    /// Event tagged with a non-active tenant; snapshot untouched.
    DiscardedTenant,
    /// Event already covered by a newer write, a tombstone, or a full refresh.
    Superseded,
    /// Event missing its row or key; snapshot untouched.
    Malformed,
}

/// Listener invoked synchronously after every successful mutation.
pub type ChangeListener = Box<dyn Fn(i64, &Arc<Snapshot>, &DiffSummary) + Send + Sync>;

struct CacheInner {
    snapshot: Arc<Snapshot>,
    revision: i64,
    fresh: bool,
    tombstones: HashSet<RecordKey>,
    applied_ts: HashMap<RecordKey, DateTime<Utc>>,
    last_refresh_ts: Option<DateTime<Utc>>,
    listeners: Vec<ChangeListener>,
}

/// Owner of the local snapshot for the active tenant.
pub struct CacheManager {
    inner: Mutex<CacheInner>,
    diagnostics: Arc<Diagnostics>,
}

impl CacheManager {
    pub fn new(tenant_id: &str, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                snapshot: Arc::new(Snapshot::empty(tenant_id)),
                revision: 0,
                fresh: false,
                tombstones: HashSet::new(),
                applied_ts: HashMap::new(),
                last_refresh_ts: None,
                listeners: Vec::new(),
            }),
            diagnostics,
        }
    }

    /// Register a listener invoked after every successful mutation, inside the
    /// apply lock, so counts derived in the listener are always consistent
    /// with the revision it was handed.
    pub fn on_change(&self, listener: ChangeListener) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        listener(inner.revision, &inner.snapshot, &DiffSummary::default());
        inner.listeners.push(listener);
    }

    /// Current snapshot and revision.
    pub fn snapshot(&self) -> (Arc<Snapshot>, i64) {
        let inner = self.inner.lock().expect("cache lock poisoned");
        (Arc::clone(&inner.snapshot), inner.revision)
    }

    pub fn revision(&self) -> i64 {
        self.inner.lock().expect("cache lock poisoned").revision
    }

    pub fn is_fresh(&self) -> bool {
        self.inner.lock().expect("cache lock poisoned").fresh
    }

    pub fn active_tenant(&self) -> String {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .snapshot
            .tenant_id
            .clone()
    }

    /// Flag the snapshot as served-but-stale until the next full refresh.
    pub fn mark_stale(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.fresh {
            tracing::warn!("Cache marked stale; serving last-known counts until refresh");
        }
        inner.fresh = false;
    }

    /// Discard the previous tenant's records and start stale for the new one.
    /// Events for the old tenant are rejected from this point on; the cache
    /// only becomes fresh again once the new tenant's full refresh lands.
    pub fn set_active_tenant(&self, tenant_id: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if inner.snapshot.tenant_id == tenant_id {
            return;
        }

        let mut diff = DiffSummary::default();
        for key in inner.snapshot.interventions.keys() {
            diff.removed.push(RecordKey::Intervention(key.clone()));
        }
        for id in inner.snapshot.assignments.keys() {
            diff.removed.push(RecordKey::Assignment(*id));
        }

        tracing::info!(
            "Switching active tenant {} -> {}, evicting {} records",
            inner.snapshot.tenant_id,
            tenant_id,
            diff.removed.len()
        );

        inner.snapshot = Arc::new(Snapshot::empty(tenant_id));
        inner.tombstones.clear();
        inner.applied_ts.clear();
        inner.last_refresh_ts = None;
        inner.fresh = false;
        inner.revision += 1;
        Self::notify(&inner, &diff);
    }

    /// Atomically replace the active tenant's snapshot with `payload`.
    ///
    /// Clears every record not present in the payload, drops all tombstones
    /// and per-record timestamps (the refresh re-establishes ground truth),
    /// bumps the revision once and marks the cache fresh. Returns the new
    /// revision.
    ///
    /// A payload for a non-active tenant is rejected: `set_active_tenant` is
    /// the only handover point, so a late refresh from a cancelled sync task
    /// can never reinstate the previous tenant's data.
    pub fn apply_full_refresh(&self, payload: RefreshPayload) -> Result<i64, AppError> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if inner.snapshot.tenant_id != payload.tenant_id {
            self.diagnostics.record_tenant_mismatch();
            tracing::warn!(
                "Discarding refresh for tenant {} while active tenant is {}",
                payload.tenant_id,
                inner.snapshot.tenant_id
            );
            return Err(AppError::TenantMismatch(format!(
                "refresh for tenant {} while active tenant is {}",
                payload.tenant_id, inner.snapshot.tenant_id
            )));
        }

        let mut interventions = HashMap::new();
        for row in payload.interventions {
            match row.key() {
                Some(key) => {
                    interventions.insert(key, row);
                }
                None => {
                    self.diagnostics.record_malformed();
                    tracing::warn!("Refresh row without a usable intervention id, skipping");
                }
            }
        }
        let assignments: HashMap<i64, InterventionAssignment> = payload
            .assignments
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        let old = Arc::clone(&inner.snapshot);
        let mut diff = DiffSummary::default();
        for (key, row) in &interventions {
            match old.interventions.get(key) {
                None => diff.added.push(RecordKey::Intervention(key.clone())),
                Some(prev) if prev != row => {
                    diff.updated.push(RecordKey::Intervention(key.clone()))
                }
                Some(_) => {}
            }
        }
        for key in old.interventions.keys() {
            if !interventions.contains_key(key) {
                diff.removed.push(RecordKey::Intervention(key.clone()));
            }
        }
        for (id, row) in &assignments {
            match old.assignments.get(id) {
                None => diff.added.push(RecordKey::Assignment(*id)),
                Some(prev) if prev != row => diff.updated.push(RecordKey::Assignment(*id)),
                Some(_) => {}
            }
        }
        for id in old.assignments.keys() {
            if !assignments.contains_key(id) {
                diff.removed.push(RecordKey::Assignment(*id));
            }
        }

        inner.snapshot = Arc::new(Snapshot {
            tenant_id: payload.tenant_id,
            interventions,
            assignments,
        });
        inner.tombstones.clear();
        inner.applied_ts.clear();
        inner.last_refresh_ts = Some(payload.fetched_at);
        inner.fresh = true;
        inner.revision += 1;

        tracing::info!(
            revision = inner.revision,
            interventions = inner.snapshot.interventions.len(),
            assignments = inner.snapshot.assignments.len(),
            "Applied full refresh"
        );
        Self::notify(&inner, &diff);
        Ok(inner.revision)
    }

    /// Apply one change event from the stream.
    pub fn apply_change_event(&self, event: ChangeEvent) -> ApplyOutcome {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if event.tenant_id != inner.snapshot.tenant_id {
            self.diagnostics.record_tenant_mismatch();
            tracing::debug!(
                "Discarding event for tenant {} while active tenant is {}",
                event.tenant_id,
                inner.snapshot.tenant_id
            );
            return ApplyOutcome::DiscardedTenant;
        }

        let Some(key) = event.key() else {
            self.diagnostics.record_malformed();
            tracing::warn!("Discarding malformed change event ({:?} {:?})", event.table, event.op);
            return ApplyOutcome::Malformed;
        };

        // Anything at or before the refresh watermark is already reflected.
        if let Some(refresh_ts) = inner.last_refresh_ts {
            if event.server_ts < refresh_ts {
                self.diagnostics.record_superseded();
                return ApplyOutcome::Superseded;
            }
        }

        let mut diff = DiffSummary::default();
        match event.op {
            ChangeOp::Delete => {
                // Delete is terminal: tombstone the key so a reordered update
                // can never resurrect the record.
                inner.tombstones.insert(key.clone());
                inner.applied_ts.remove(&key);
                let snapshot = Arc::make_mut(&mut inner.snapshot);
                let removed = match &key {
                    RecordKey::Intervention(k) => snapshot.interventions.remove(k).is_some(),
                    RecordKey::Assignment(id) => snapshot.assignments.remove(id).is_some(),
                };
                if removed {
                    diff.removed.push(key);
                }
            }
            ChangeOp::Insert | ChangeOp::Update => {
                if inner.tombstones.contains(&key) {
                    self.diagnostics.record_superseded();
                    return ApplyOutcome::Superseded;
                }
                if let Some(prev_ts) = inner.applied_ts.get(&key) {
                    if event.server_ts < *prev_ts {
                        self.diagnostics.record_superseded();
                        return ApplyOutcome::Superseded;
                    }
                }
                inner.applied_ts.insert(key.clone(), event.server_ts);

                let snapshot = Arc::make_mut(&mut inner.snapshot);
                match (&key, event.intervention, event.assignment) {
                    (RecordKey::Intervention(k), Some(row), _) => {
                        match snapshot.interventions.insert(k.clone(), row) {
                            None => diff.added.push(key),
                            Some(prev) => {
                                if &prev != snapshot.interventions.get(k).expect("just inserted") {
                                    diff.updated.push(key);
                                }
                            }
                        }
                    }
                    (RecordKey::Assignment(id), _, Some(row)) => {
                        match snapshot.assignments.insert(*id, row) {
                            None => diff.added.push(key),
                            Some(prev) => {
                                if &prev != snapshot.assignments.get(id).expect("just inserted") {
                                    diff.updated.push(key);
                                }
                            }
                        }
                    }
                    _ => {
                        self.diagnostics.record_malformed();
                        return ApplyOutcome::Malformed;
                    }
                }
            }
        }

        inner.revision += 1;
        let revision = inner.revision;
        Self::notify(&inner, &diff);
        ApplyOutcome::Applied(revision)
    }

    fn notify(inner: &CacheInner, diff: &DiffSummary) {
        for listener in &inner.listeners {
            listener(inner.revision, &inner.snapshot, diff);
        }
    }
}
