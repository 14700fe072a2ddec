//! Diagnostics endpoint.

use axum::extract::State;

use super::{success, ApiResult};
use crate::diagnostics::DiagnosticsReport;
use crate::AppState;

/// GET /api/diagnostics - Degradation counters.
pub async fn get_diagnostics(State(state): State<AppState>) -> ApiResult<DiagnosticsReport> {
    success(state.diagnostics.report(), state.cache.revision())
}
