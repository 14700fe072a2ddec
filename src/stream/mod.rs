//! Change stream subscription and sync lifecycle.
//!
//! The transport is an external collaborator with an at-least-once contract;
//! this module owns the correctness backstop around it: after any subscribe
//! or resubscribe, a full refresh is mandatory before the cache is declared
//! fresh again, because the stream alone cannot be trusted to have delivered
//! every event during an outage.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::{CacheManager, RefreshPayload};
use crate::errors::AppError;
use crate::models::ChangeEvent;

/// Push channel delivering row-level change events for one tenant.
///
/// Delivery is at-least-once and may reorder relative to a prior full fetch.
/// The returned receiver closing (or an Err) signals a transport outage.
pub trait ChangeSource: Send + Sync {
    fn subscribe(
        &self,
        tenant_id: &str,
    ) -> impl Future<Output = Result<mpsc::Receiver<ChangeEvent>, AppError>> + Send;
}

/// Full-dataset fetch from the system of record.
pub trait SnapshotSource: Send + Sync {
    fn fetch_all(
        &self,
        tenant_id: &str,
    ) -> impl Future<Output = Result<RefreshPayload, AppError>> + Send;
}

/// Capped exponential backoff for transport retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Handle for an active subscription; dropping it does not stop the task,
/// `SyncService::stop` does.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub tenant_id: String,
}

/// Owner of the refresh → subscribe → apply loop.
///
/// Single logical writer per tenant: all cache mutations flow through the one
/// task this service spawns.
pub struct SyncService<C, S> {
    cache: Arc<CacheManager>,
    changes: Arc<C>,
    snapshots: Arc<S>,
    backoff: BackoffPolicy,
    task: Mutex<Option<(SubscriptionHandle, JoinHandle<()>)>>,
}

impl<C, S> SyncService<C, S>
where
    C: ChangeSource + 'static,
    S: SnapshotSource + 'static,
{
    pub fn new(
        cache: Arc<CacheManager>,
        changes: Arc<C>,
        snapshots: Arc<S>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            cache,
            changes,
            snapshots,
            backoff,
            task: Mutex::new(None),
        }
    }

    /// Start syncing the given tenant. Replaces any previous subscription.
    pub async fn start(&self, tenant_id: &str) -> SubscriptionHandle {
        let mut guard = self.task.lock().await;
        if let Some((old, handle)) = guard.take() {
            tracing::info!(subscription = %old.id, "Cancelling previous subscription");
            handle.abort();
            let _ = handle.await;
        }

        let handle = SubscriptionHandle {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
        };
        tracing::info!(subscription = %handle.id, tenant = tenant_id, "Starting sync");

        let cache = Arc::clone(&self.cache);
        let changes = Arc::clone(&self.changes);
        let snapshots = Arc::clone(&self.snapshots);
        let backoff = self.backoff;
        let tenant = tenant_id.to_string();

        let task = tokio::spawn(async move {
            run_sync_loop(cache, changes, snapshots, backoff, tenant).await;
        });
        *guard = Some((handle.clone(), task));
        handle
    }

    /// Stop event delivery and cancel any in-flight refresh fetch. Waits for
    /// the task to wind down so no apply can straddle a tenant switch.
    pub async fn stop(&self) {
        if let Some((handle, task)) = self.task.lock().await.take() {
            tracing::info!(subscription = %handle.id, "Unsubscribed");
            task.abort();
            let _ = task.await;
        }
    }

    /// Cancel and discard all in-flight work for the previous tenant, evict
    /// its records, then start syncing the new tenant.
    pub async fn switch_tenant(&self, tenant_id: &str) -> SubscriptionHandle {
        self.stop().await;
        self.cache.set_active_tenant(tenant_id);
        self.start(tenant_id).await
    }
}

/// The sync loop: mandatory full refresh, then consume the stream until it
/// breaks, then mark stale, back off and start over. Never returns.
async fn run_sync_loop<C, S>(
    cache: Arc<CacheManager>,
    changes: Arc<C>,
    snapshots: Arc<S>,
    backoff: BackoffPolicy,
    tenant: String,
) where
    C: ChangeSource,
    S: SnapshotSource,
{
    let mut attempt: u32 = 0;
    loop {
        // Refresh first: the correctness backstop against dropped events.
        let refreshed = snapshots
            .fetch_all(&tenant)
            .await
            .and_then(|payload| cache.apply_full_refresh(payload));
        match refreshed {
            Ok(_) => attempt = 0,
            Err(err) => {
                cache.mark_stale();
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(
                    tenant = %tenant,
                    "Full refresh failed ({}), retrying in {:?}",
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        match changes.subscribe(&tenant).await {
            Ok(mut rx) => {
                tracing::info!(tenant = %tenant, "Subscribed to change stream");
                while let Some(event) = rx.recv().await {
                    cache.apply_change_event(event);
                }
                tracing::warn!(tenant = %tenant, "Change stream closed");
            }
            Err(err) => {
                tracing::warn!(tenant = %tenant, "Subscribe failed: {}", err);
            }
        }

        // Whatever happened during the outage, the stream cannot be trusted
        // until the next refresh lands.
        cache.mark_stale();
        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}
