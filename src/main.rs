//! FieldSync Engine
//!
//! Tenant-scoped synchronized cache over field-service interventions and
//! assignments, with derived aggregate counts and notification escalation,
//! served over a read-only REST surface.

mod aggregates;
mod api;
mod cache;
mod config;
mod db;
mod diagnostics;
mod errors;
mod escalation;
mod models;
mod overrides;
mod stream;

use std::sync::Arc;

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aggregates::AggregateEngine;
use cache::CacheManager;
use config::Config;
use db::{PollingChangeSource, Repository};
use diagnostics::Diagnostics;
use escalation::{EscalationEngine, ReminderPolicy};
use overrides::OverrideStore;
use stream::{BackoffPolicy, SyncService};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
    pub aggregates: Arc<AggregateEngine>,
    pub escalation: Arc<EscalationEngine>,
    pub overrides: Arc<OverrideStore>,
    pub diagnostics: Arc<Diagnostics>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting FieldSync Engine");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Override store: {:?}", config.overrides_path);
    tracing::info!("Active tenant: {}", config.tenant_id);
    tracing::info!("Bind address: {}", config.bind_addr);

    // System-of-record adapter
    let pool = db::init_database(&config.db_path).await?;
    let repo = Repository::new(pool);

    // Engine wiring: cache, then the derived engines attached to it
    let diagnostics = Arc::new(Diagnostics::default());
    let cache = Arc::new(CacheManager::new(&config.tenant_id, Arc::clone(&diagnostics)));
    let overrides = Arc::new(OverrideStore::open(config.overrides_path.clone()));

    let aggregates = Arc::new(AggregateEngine::new(
        Arc::clone(&overrides),
        Arc::clone(&diagnostics),
    ));
    aggregates.attach(&cache);

    let (escalation, mut reminders) = EscalationEngine::new(
        Arc::clone(&cache),
        ReminderPolicy::from_config(&config),
        Arc::clone(&diagnostics),
    );
    escalation.attach();
    escalation.start(config.tick_interval);

    // Delivery collaborator: this deployment only logs reminder-due signals;
    // the upstream dispatcher sends the actual notifications.
    tokio::spawn(async move {
        while let Some(signal) = reminders.recv().await {
            tracing::info!(
                assignment = signal.assignment_id,
                priority = signal.priority.as_str(),
                reminder_count = signal.reminder_count,
                "Forwarding reminder-due signal"
            );
        }
    });

    // Sync loop: full refresh, then consume the outbox as a change stream
    let changes = Arc::new(PollingChangeSource::new(repo.clone(), config.poll_interval));
    let sync = SyncService::new(
        Arc::clone(&cache),
        changes,
        Arc::new(repo),
        BackoffPolicy {
            base: config.backoff_base,
            cap: config.backoff_cap,
        },
    );
    sync.start(&config.tenant_id).await;

    // Create application state
    let state = AppState {
        cache,
        aggregates,
        escalation,
        overrides,
        diagnostics,
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // API routes
    let api_routes = Router::new()
        // Derived counts
        .route("/counts", get(api::get_counts))
        .route("/sync/revision", get(api::get_revision))
        // Notifications
        .route("/notifications/urgent", get(api::list_urgent_notifications))
        // Overrides
        .route("/overrides", get(api::list_overrides))
        .route(
            "/overrides/{id}",
            put(api::set_override).delete(api::clear_override),
        )
        // Diagnostics
        .route("/diagnostics", get(api::get_diagnostics));

    // Health check
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
