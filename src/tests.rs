//! Integration tests for the fieldsync engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::aggregates::AggregateEngine;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::db::{init_database, PollingChangeSource, Repository};
use crate::diagnostics::Diagnostics;
use crate::escalation::{EscalationEngine, ReminderPolicy};
use crate::models::{Intervention, InterventionAssignment, InterventionStatus, Priority};
use crate::overrides::OverrideStore;
use crate::stream::{BackoffPolicy, SyncService};
use crate::{create_router, AppState};

const TENANT: &str = "acme";

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    repo: Repository,
    _sync: Arc<SyncService<PollingChangeSource, Repository>>,
    _temp_dir: TempDir,
}

impl TestFixture {
    /// Seed the store, wire the full engine and serve it on a random port.
    async fn new(
        interventions: Vec<Intervention>,
        assignments: Vec<InterventionAssignment>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");
        let overrides_path = temp_dir.path().join("overrides.json");

        let pool = init_database(&db_path).await.expect("Failed to init DB");
        let repo = Repository::new(pool);

        for row in &interventions {
            repo.upsert_intervention(row).await.expect("seed intervention");
        }
        for row in &assignments {
            repo.upsert_assignment(row).await.expect("seed assignment");
        }

        let config = Config {
            db_path,
            overrides_path: overrides_path.clone(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "warn".to_string(),
            tenant_id: TENANT.to_string(),
            poll_interval: Duration::from_millis(25),
            tick_interval: Duration::from_secs(60),
            reminder_critical: Duration::from_secs(900),
            reminder_urgent: Duration::from_secs(3600),
            reminder_normal: None,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
        };

        let diagnostics = Arc::new(Diagnostics::default());
        let cache = Arc::new(CacheManager::new(TENANT, Arc::clone(&diagnostics)));
        let overrides = Arc::new(OverrideStore::open(overrides_path));

        let aggregates = Arc::new(AggregateEngine::new(
            Arc::clone(&overrides),
            Arc::clone(&diagnostics),
        ));
        aggregates.attach(&cache);

        let (escalation, _reminders) = EscalationEngine::new(
            Arc::clone(&cache),
            ReminderPolicy::from_config(&config),
            Arc::clone(&diagnostics),
        );
        escalation.attach();

        let changes = Arc::new(PollingChangeSource::new(repo.clone(), config.poll_interval));
        let sync = Arc::new(SyncService::new(
            Arc::clone(&cache),
            changes,
            Arc::new(repo.clone()),
            BackoffPolicy {
                base: config.backoff_base,
                cap: config.backoff_cap,
            },
        ));
        sync.start(TENANT).await;

        let state = AppState {
            cache,
            aggregates,
            escalation,
            overrides,
            diagnostics,
            config: Arc::new(config),
        };

        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestFixture {
            client: Client::new(),
            base_url,
            repo,
            _sync: sync,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn counts(&self) -> Value {
        let resp = self
            .client
            .get(self.url("/api/counts"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    /// Poll the counts endpoint until the predicate holds or time runs out.
    async fn wait_for_counts<F: Fn(&Value) -> bool>(&self, predicate: F) -> Value {
        for _ in 0..100 {
            let body = self.counts().await;
            if predicate(&body) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("counts never reached the expected state");
    }
}

fn intervention(id: i64, status: InterventionStatus, date_start: Option<String>) -> Intervention {
    Intervention {
        id: Some(id),
        autonomous_id: None,
        tenant_id: TENANT.to_string(),
        ref_code: format!("INT-{id}"),
        label: format!("Job {id}"),
        date_start,
        status,
    }
}

fn assignment(id: i64, priority: Priority) -> InterventionAssignment {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(id);
    InterventionAssignment {
        id,
        tenant_id: TENANT.to_string(),
        intervention_id: Some(id),
        autonomous_intervention_id: None,
        intervention_label: format!("Job {id}"),
        intervention_ref: format!("INT-{id}"),
        worker_name: "Dana".to_string(),
        client_name: Some("Moulin SA".to_string()),
        location: Some("Lyon".to_string()),
        is_primary: true,
        priority,
        date_planned: None,
        notification_sent: true,
        notification_acknowledged: false,
        acknowledged_at: None,
        last_reminder_sent: None,
        reminder_count: 0,
        assigned_by: "dispatch".to_string(),
        assigned_at: t,
        created_at: t,
        updated_at: t,
    }
}

/// Today's UTC date as an RFC3339 morning timestamp.
fn today_at_ten() -> String {
    format!("{}T10:00:00Z", Utc::now().date_naive())
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new(Vec::new(), Vec::new()).await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_available_count_follows_store_changes() {
    let fixture = TestFixture::new(
        vec![
            intervention(1, InterventionStatus::Available, None),
            intervention(2, InterventionStatus::Available, None),
            intervention(3, InterventionStatus::Available, None),
        ],
        Vec::new(),
    )
    .await;

    let body = fixture
        .wait_for_counts(|body| body["data"]["available"] == json!(3))
        .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["fresh"], true);

    // A dispatcher deletes one; the count follows through the change stream.
    fixture
        .repo
        .delete_intervention(TENANT, &crate::models::InterventionKey::Numeric(2))
        .await
        .unwrap();
    fixture
        .wait_for_counts(|body| body["data"]["available"] == json!(2))
        .await;

    // And a new available intervention brings it back.
    fixture
        .repo
        .upsert_intervention(&intervention(4, InterventionStatus::Available, None))
        .await
        .unwrap();
    fixture
        .wait_for_counts(|body| body["data"]["available"] == json!(3))
        .await;
}

#[tokio::test]
async fn test_revision_advances_with_changes() {
    let fixture = TestFixture::new(
        vec![intervention(1, InterventionStatus::Available, None)],
        Vec::new(),
    )
    .await;
    fixture
        .wait_for_counts(|body| body["data"]["available"] == json!(1))
        .await;

    let resp = fixture
        .client
        .get(fixture.url("/api/sync/revision"))
        .send()
        .await
        .unwrap();
    let before: Value = resp.json().await.unwrap();
    assert_eq!(before["data"]["tenantId"], TENANT);
    assert_eq!(before["data"]["fresh"], true);
    let revision_before = before["data"]["revision"].as_i64().unwrap();
    assert!(revision_before >= 1);

    fixture
        .repo
        .upsert_intervention(&intervention(2, InterventionStatus::Available, None))
        .await
        .unwrap();
    fixture
        .wait_for_counts(|body| body["data"]["available"] == json!(2))
        .await;

    let resp = fixture
        .client
        .get(fixture.url("/api/sync/revision"))
        .send()
        .await
        .unwrap();
    let after: Value = resp.json().await.unwrap();
    assert!(after["data"]["revision"].as_i64().unwrap() > revision_before);
}

#[tokio::test]
async fn test_override_moves_today_count() {
    let fixture = TestFixture::new(
        vec![intervention(
            1,
            InterventionStatus::Assigned,
            Some(today_at_ten()),
        )],
        Vec::new(),
    )
    .await;
    fixture
        .wait_for_counts(|body| body["data"]["today"] == json!(1))
        .await;

    // Local correction: the user moves it to tomorrow. Canonical data untouched.
    let tomorrow = (Utc::now().date_naive() + ChronoDuration::days(1)).to_string();
    let resp = fixture
        .client
        .put(fixture.url("/api/overrides/1"))
        .json(&json!({ "value": tomorrow }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = fixture.counts().await;
    assert_eq!(body["data"]["today"], json!(0));

    // Clearing the override restores the canonical date.
    let resp = fixture
        .client
        .delete(fixture.url("/api/overrides/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = fixture.counts().await;
    assert_eq!(body["data"]["today"], json!(1));
}

#[tokio::test]
async fn test_override_validation_and_missing_clear() {
    let fixture = TestFixture::new(Vec::new(), Vec::new()).await;

    let resp = fixture
        .client
        .put(fixture.url("/api/overrides/1"))
        .json(&json!({ "value": "not a date" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let resp = fixture
        .client
        .delete(fixture.url("/api/overrides/99"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_emergency_count_and_urgent_list() {
    let mut critical = assignment(1, Priority::Critical);
    critical.last_reminder_sent = Some(critical.assigned_at + ChronoDuration::hours(1));
    critical.reminder_count = 2;
    let urgent = assignment(2, Priority::Urgent);
    let normal = assignment(3, Priority::Normal);

    let fixture = TestFixture::new(Vec::new(), vec![critical, urgent, normal]).await;

    // Only the critical unacknowledged assignment is an open emergency.
    fixture
        .wait_for_counts(|body| body["data"]["openEmergency"] == json!(1))
        .await;

    let resp = fixture
        .client
        .get(fixture.url("/api/notifications/urgent"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let list = body["data"].as_array().unwrap();
    assert_eq!(list.len(), 2, "normal priority is not listed");
    // Newest assigned_at first: assignment 2 was assigned after assignment 1.
    assert_eq!(list[0]["assignmentId"], json!(2));
    assert_eq!(list[0]["isNew"], json!(true));
    assert_eq!(list[1]["assignmentId"], json!(1));
    assert_eq!(list[1]["isReminder"], json!(true));
    assert_eq!(list[1]["reminderCount"], json!(2));

    // Acknowledgment drops the emergency count.
    let mut acked = assignment(1, Priority::Critical);
    acked.notification_acknowledged = true;
    acked.acknowledged_at = Some(Utc::now());
    acked.updated_at = Utc::now();
    fixture.repo.upsert_assignment(&acked).await.unwrap();
    fixture
        .wait_for_counts(|body| body["data"]["openEmergency"] == json!(0))
        .await;
}

#[tokio::test]
async fn test_diagnostics_endpoint_starts_clean() {
    let fixture = TestFixture::new(Vec::new(), Vec::new()).await;

    let resp = fixture
        .client
        .get(fixture.url("/api/diagnostics"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["tenantMismatches"], json!(0));
    assert_eq!(body["data"]["storeInconsistencies"], json!(0));
}
