//! Urgent-notification endpoint.

use axum::extract::State;

use super::{success, ApiResult};
use crate::models::UrgentNotification;
use crate::AppState;

/// GET /api/notifications/urgent - Unacknowledged urgent and critical
/// assignments, newest first.
pub async fn list_urgent_notifications(
    State(state): State<AppState>,
) -> ApiResult<Vec<UrgentNotification>> {
    let list = state.escalation.list_urgent_notifications();
    success(list, state.cache.revision())
}
