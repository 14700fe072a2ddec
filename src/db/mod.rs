//! SQLite adapter for the system of record.
//!
//! The upstream store owns this data; this module is the local fetch path for
//! full refreshes and the change-log outbox the bundled polling source reads.

mod repository;

pub use repository::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interventions (
            key TEXT PRIMARY KEY,
            numeric_id INTEGER,
            autonomous_id TEXT,
            tenant_id TEXT NOT NULL,
            ref_code TEXT NOT NULL,
            label TEXT NOT NULL,
            date_start TEXT,
            status TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignments (
            id INTEGER PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            intervention_id INTEGER,
            autonomous_intervention_id TEXT,
            intervention_label TEXT NOT NULL,
            intervention_ref TEXT NOT NULL,
            worker_name TEXT NOT NULL,
            client_name TEXT,
            location TEXT,
            is_primary INTEGER NOT NULL DEFAULT 0,
            priority TEXT NOT NULL,
            date_planned TEXT,
            notification_sent INTEGER NOT NULL DEFAULT 0,
            notification_acknowledged INTEGER NOT NULL DEFAULT 0,
            acknowledged_at TEXT,
            last_reminder_sent TEXT,
            reminder_count INTEGER NOT NULL DEFAULT 0,
            assigned_by TEXT NOT NULL,
            assigned_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS change_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_interventions_tenant ON interventions(tenant_id)",
        "CREATE INDEX IF NOT EXISTS idx_assignments_tenant ON assignments(tenant_id)",
        "CREATE INDEX IF NOT EXISTS idx_change_log_tenant_seq ON change_log(tenant_id, seq)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
