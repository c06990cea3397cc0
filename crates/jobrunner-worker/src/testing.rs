//! Shared fixtures for the worker's unit tests.

use std::sync::Arc;

use chrono::{Duration, Utc};
use jobrunner_engine::{JobBackend, NoCron, SqliteHostnameResolver, SqliteJobStore};
use rusqlite::{params, Connection};
use tempfile::TempDir;

/// A throwaway on-disk database; every handle opens its own connection.
pub struct TestDb {
    _dir: TempDir,
    pub path: String,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.db").to_string_lossy().into_owned();
        SqliteJobStore::open(&path).unwrap();
        Self { _dir: dir, path }
    }

    pub fn store(&self) -> Arc<SqliteJobStore> {
        Arc::new(SqliteJobStore::open(&self.path).unwrap())
    }

    pub fn backend(&self) -> JobBackend {
        let resolver = SqliteHostnameResolver::new(Connection::open(&self.path).unwrap()).unwrap();
        JobBackend::new(self.store(), Arc::new(resolver), Arc::new(NoCron))
    }

    /// A one-time job that came due a few seconds ago.
    pub fn seed_job(&self, id: &str, site_id: &str, timeout_secs: u32) {
        let conn = Connection::open(&self.path).unwrap();
        let due = (Utc::now() - Duration::seconds(5)).timestamp_millis();
        conn.execute(
            "INSERT INTO automation_jobs
             (id, org_id, site_id, user_id, name, trigger_type, run_at, next_run_at,
              action_timeout_seconds)
             VALUES (?1, 'org', ?2, 'user', ?1, 'one-time', ?3, ?3, ?4)",
            params![id, site_id, due, timeout_secs],
        )
        .unwrap();
    }

    pub fn seed_domain(&self, site_id: &str, hostname: &str) {
        let conn = Connection::open(&self.path).unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO domains (site_id, hostname) VALUES (?1, ?2)",
            params![site_id, hostname],
        )
        .unwrap();
    }
}
