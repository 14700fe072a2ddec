//! Date-override endpoints.
//!
//! The override store is user-facing: a client sets a local correction and
//! clears it explicitly. Setting or clearing triggers a recomputation because
//! the cache cannot observe override changes.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::{error, success, ApiResult};
use crate::errors::AppError;
use crate::models::InterventionKey;
use crate::AppState;

/// Request body for setting an override.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOverrideRequest {
    pub value: String,
}

/// GET /api/overrides - All current overrides, keyed by intervention id.
pub async fn list_overrides(State(state): State<AppState>) -> ApiResult<HashMap<String, String>> {
    success(state.overrides.all(), state.cache.revision())
}

/// PUT /api/overrides/:id - Set a date override for an intervention.
pub async fn set_override(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SetOverrideRequest>,
) -> ApiResult<()> {
    let revision = state.cache.revision();

    if crate::aggregates::parse_event_date(&request.value).is_none() {
        return error(
            AppError::Validation(format!("Unparseable override date {:?}", request.value)),
            revision,
        );
    }

    state.overrides.set(&intervention_key(&id), request.value);
    state.aggregates.recompute_from(&state.cache);
    success((), state.cache.revision())
}

/// DELETE /api/overrides/:id - Clear the override for an intervention.
pub async fn clear_override(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let revision = state.cache.revision();

    if !state.overrides.clear(&intervention_key(&id)) {
        return error(
            AppError::NotFound(format!("No override for intervention {}", id)),
            revision,
        );
    }

    state.aggregates.recompute_from(&state.cache);
    success((), state.cache.revision())
}

/// Path ids are numeric when they parse as such, autonomous otherwise.
/// The two identifier spaces are mutually exclusive upstream.
fn intervention_key(id: &str) -> InterventionKey {
    match id.parse::<i64>() {
        Ok(numeric) => InterventionKey::Numeric(numeric),
        Err(_) => InterventionKey::Autonomous(id.to_string()),
    }
}
