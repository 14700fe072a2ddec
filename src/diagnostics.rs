//! Degradation counters shared across the engine.
//!
//! None of these conditions is fatal; they are counted here and exposed on the
//! diagnostics endpoint so a degraded deployment is visible without log spelunking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters for discarded and degraded work.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Events discarded because they were tagged with a non-active tenant.
    pub tenant_mismatches: AtomicU64,
    /// Events discarded because a full refresh already covered their timestamp.
    pub superseded_events: AtomicU64,
    /// Records excluded from aggregate computation (unparseable date, missing id).
    pub malformed_records: AtomicU64,
    /// Duplicate-primary observations surfaced as warnings.
    pub store_inconsistencies: AtomicU64,
}

/// Point-in-time copy of the counters, for the HTTP surface.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub tenant_mismatches: u64,
    pub superseded_events: u64,
    pub malformed_records: u64,
    pub store_inconsistencies: u64,
}

impl Diagnostics {
    pub fn record_tenant_mismatch(&self) {
        self.tenant_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.superseded_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inconsistency(&self) {
        self.store_inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            tenant_mismatches: self.tenant_mismatches.load(Ordering::Relaxed),
            superseded_events: self.superseded_events.load(Ordering::Relaxed),
            malformed_records: self.malformed_records.load(Ordering::Relaxed),
            store_inconsistencies: self.store_inconsistencies.load(Ordering::Relaxed),
        }
    }
}
