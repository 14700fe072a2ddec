//! Configuration module for the fieldsync engine.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite file backing the system-of-record adapter
    pub db_path: PathBuf,
    /// Path to the local date-override store (plain JSON, no schema versioning)
    pub overrides_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Tenant whose records this instance caches
    pub tenant_id: String,
    /// Change-log poll interval for the bundled polling source
    pub poll_interval: Duration,
    /// Reminder evaluation tick interval
    pub tick_interval: Duration,
    /// Elapsed time before a critical assignment becomes reminder-due
    pub reminder_critical: Duration,
    /// Elapsed time before an urgent assignment becomes reminder-due
    pub reminder_urgent: Duration,
    /// Elapsed time for normal-priority reminders; None means normal never reminds
    pub reminder_normal: Option<Duration>,
    /// Base delay for transport retry backoff
    pub backoff_base: Duration,
    /// Ceiling for transport retry backoff
    pub backoff_cap: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let db_path = env::var("FIELDSYNC_DB_PATH")
            .unwrap_or_else(|_| "./data/app.sqlite".to_string())
            .into();

        let overrides_path = env::var("FIELDSYNC_OVERRIDES_PATH")
            .unwrap_or_else(|_| "./data/overrides.json".to_string())
            .into();

        let bind_addr = env::var("FIELDSYNC_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .expect("Invalid FIELDSYNC_BIND_ADDR format");

        let log_level = env::var("FIELDSYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let tenant_id = env::var("FIELDSYNC_TENANT").unwrap_or_else(|_| "default".to_string());

        Self {
            db_path,
            overrides_path,
            bind_addr,
            log_level,
            tenant_id,
            poll_interval: secs_from_env("FIELDSYNC_POLL_INTERVAL_SECS", 2),
            tick_interval: secs_from_env("FIELDSYNC_TICK_INTERVAL_SECS", 60),
            reminder_critical: secs_from_env("FIELDSYNC_REMINDER_CRITICAL_SECS", 900),
            reminder_urgent: secs_from_env("FIELDSYNC_REMINDER_URGENT_SECS", 3600),
            reminder_normal: opt_secs_from_env("FIELDSYNC_REMINDER_NORMAL_SECS"),
            backoff_base: secs_from_env("FIELDSYNC_BACKOFF_BASE_SECS", 1),
            backoff_cap: secs_from_env("FIELDSYNC_BACKOFF_CAP_SECS", 30),
        }
    }
}

/// Read a duration in whole seconds, falling back to a default.
fn secs_from_env(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

/// Read an optional duration in whole seconds; unset or unparseable means absent.
fn opt_secs_from_env(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}
