//! Derived-count endpoints.

use axum::extract::State;
use serde::Serialize;

use super::{success, ApiResult};
use crate::AppState;

/// The three derived counts plus the freshness flag.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountsResponse {
    pub available: u64,
    pub today: u64,
    pub open_emergency: u64,
    /// False while the cache is serving last-known values during an outage.
    pub fresh: bool,
}

/// Snapshot revision info.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionInfo {
    pub revision: i64,
    pub tenant_id: String,
    pub fresh: bool,
}

/// GET /api/counts - The three derived counts.
pub async fn get_counts(State(state): State<AppState>) -> ApiResult<CountsResponse> {
    let counts = state.aggregates.counts();
    let response = CountsResponse {
        available: counts.available,
        today: counts.today,
        open_emergency: counts.open_emergency,
        fresh: state.cache.is_fresh(),
    };
    success(response, state.cache.revision())
}

/// GET /api/sync/revision - Current snapshot revision.
pub async fn get_revision(State(state): State<AppState>) -> ApiResult<RevisionInfo> {
    let revision = state.cache.revision();
    success(
        RevisionInfo {
            revision,
            tenant_id: state.cache.active_tenant(),
            fresh: state.cache.is_fresh(),
        },
        revision,
    )
}
