use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobrunner_core::config::LEASE_BUFFER_SECS;
use jobrunner_core::{JobId, RunId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::db::init_db;
use crate::error::{EngineError, Result};
use crate::types::{AutomationJob, AutomationRun, RunStatus, TriggerType};

/// How long a writer waits on another process's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The (job, run id) pair every write after the initial claim is
/// conditioned on. A write through a stale lease affects zero rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub run_id: RunId,
}

/// Column values written by a single-job claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub run_id: RunId,
    pub claimed_by: String,
    pub running_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Column values written when a run finishes. Lease columns are always
/// cleared alongside these.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishUpdate {
    pub last_run_at: DateTime<Utc>,
    pub last_run_status: RunStatus,
    pub last_run_error: Option<String>,
    pub last_run_duration_ms: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub consecutive_failures: u32,
}

/// Relational store behind the engine.
///
/// Every mutating method reports whether its predicate held (`true`) or
/// another party got there first (`false`). Contention is never an `Err`.
pub trait JobStore: Send + Sync {
    /// Atomically claim up to `limit` due, unclaimed jobs for `claimed_by`.
    ///
    /// Must mark the rows claimed (fresh run id, lease) in the same atomic
    /// step that selects them, so concurrent callers never share a job.
    fn claim_due_jobs(
        &self,
        server_id: &str,
        limit: usize,
        claimed_by: &str,
    ) -> Result<Vec<AutomationJob>>;

    /// Claim one job, only if nobody holds it (`running_at IS NULL`).
    fn try_claim(&self, job_id: &JobId, claim: &ClaimRequest) -> Result<bool>;

    /// Clear the lease columns. With `Some(run_id)` only that claim is
    /// released; a newer claim by someone else is left alone.
    fn release_claim(&self, job_id: &JobId, run_id: Option<&RunId>) -> Result<bool>;

    /// Push `lease_expires_at` forward if `lease` still owns the row.
    fn extend_lease(&self, lease: &Lease, lease_expires_at: DateTime<Utc>) -> Result<bool>;

    /// Clear the lease and record the outcome if `lease` still owns the row.
    fn finish_run(&self, lease: &Lease, update: &FinishUpdate) -> Result<bool>;

    /// Append one history record.
    fn insert_run(&self, run: &AutomationRun) -> Result<()>;

    fn get_job(&self, job_id: &JobId) -> Result<Option<AutomationJob>>;
}

const JOB_COLUMNS: &str = "id, org_id, site_id, user_id, name, trigger_type,
    cron_schedule, cron_timezone, next_run_at, run_at, running_at, run_id,
    claimed_by, lease_expires_at, action_timeout_seconds, last_run_at,
    last_run_status, last_run_error, last_run_duration_ms,
    consecutive_failures, is_active";

/// [`JobStore`] over a single SQLite connection.
///
/// Each process (or each test "process") opens its own connection to the
/// same database file; SQLite's write lock provides the cross-process
/// exclusion the claim protocol relies on.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    /// Most recent history rows for a job, newest first.
    pub fn list_runs(&self, job_id: &JobId, limit: usize) -> Result<Vec<AutomationRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, started_at, completed_at, duration_ms, status,
                    error, result, messages, triggered_by
             FROM automation_runs
             WHERE job_id = ?1
             ORDER BY started_at DESC
             LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![job_id.as_str(), limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Number of active jobs with the given trigger type.
    pub fn count_active_jobs(&self, trigger_type: TriggerType) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM automation_jobs WHERE is_active = 1 AND trigger_type = ?1",
            params![trigger_type.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::InvalidData("sqlite connection lock poisoned".to_string()))
    }
}

impl JobStore for SqliteJobStore {
    fn claim_due_jobs(
        &self,
        server_id: &str,
        limit: usize,
        claimed_by: &str,
    ) -> Result<Vec<AutomationJob>> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn()?;

        // IMMEDIATE takes the write lock up front: a second worker blocks
        // here (busy_timeout) and then sees the rows already claimed.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let due: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT j.id FROM automation_jobs j
                 WHERE j.is_active = 1
                   AND j.running_at IS NULL
                   AND j.next_run_at IS NOT NULL
                   AND j.next_run_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM domains d
                       WHERE d.site_id = j.site_id
                         AND d.server_id IS NOT NULL
                         AND d.server_id <> ?2)
                 ORDER BY j.next_run_at
                 LIMIT ?3",
            )?;
            let ids = stmt
                .query_map(params![now, server_id, limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        let mut jobs = Vec::with_capacity(due.len());
        {
            let sql = format!(
                "UPDATE automation_jobs
                 SET running_at = ?2,
                     run_id = ?3,
                     claimed_by = ?4,
                     lease_expires_at = ?2 + (action_timeout_seconds + ?5) * 1000
                 WHERE id = ?1 AND running_at IS NULL
                 RETURNING {JOB_COLUMNS}"
            );
            let mut stmt = tx.prepare(&sql)?;
            for id in &due {
                let run_id = RunId::new();
                let job = stmt
                    .query_row(
                        params![id, now, run_id.as_str(), claimed_by, LEASE_BUFFER_SECS as i64],
                        row_to_job,
                    )
                    .optional()?;
                jobs.extend(job);
            }
        }
        tx.commit()?;

        debug!(count = jobs.len(), %server_id, "claimed due jobs");
        Ok(jobs)
    }

    fn try_claim(&self, job_id: &JobId, claim: &ClaimRequest) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE automation_jobs
             SET running_at = ?2, run_id = ?3, claimed_by = ?4, lease_expires_at = ?5
             WHERE id = ?1 AND running_at IS NULL",
            params![
                job_id.as_str(),
                claim.running_at.timestamp_millis(),
                claim.run_id.as_str(),
                claim.claimed_by,
                claim.lease_expires_at.timestamp_millis(),
            ],
        )?;
        Ok(n > 0)
    }

    fn release_claim(&self, job_id: &JobId, run_id: Option<&RunId>) -> Result<bool> {
        let conn = self.conn()?;
        let n = match run_id {
            Some(run_id) => conn.execute(
                "UPDATE automation_jobs
                 SET running_at = NULL, run_id = NULL, claimed_by = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND run_id = ?2",
                params![job_id.as_str(), run_id.as_str()],
            )?,
            None => conn.execute(
                "UPDATE automation_jobs
                 SET running_at = NULL, run_id = NULL, claimed_by = NULL, lease_expires_at = NULL
                 WHERE id = ?1 AND running_at IS NOT NULL",
                params![job_id.as_str()],
            )?,
        };
        Ok(n > 0)
    }

    fn extend_lease(&self, lease: &Lease, lease_expires_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE automation_jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND run_id = ?2",
            params![
                lease.job_id.as_str(),
                lease.run_id.as_str(),
                lease_expires_at.timestamp_millis()
            ],
        )?;
        Ok(n > 0)
    }

    fn finish_run(&self, lease: &Lease, update: &FinishUpdate) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE automation_jobs
             SET running_at = NULL, run_id = NULL, claimed_by = NULL, lease_expires_at = NULL,
                 last_run_at = ?3, last_run_status = ?4, last_run_error = ?5,
                 last_run_duration_ms = ?6, next_run_at = ?7, is_active = ?8,
                 consecutive_failures = ?9
             WHERE id = ?1 AND run_id = ?2",
            params![
                lease.job_id.as_str(),
                lease.run_id.as_str(),
                update.last_run_at.timestamp_millis(),
                update.last_run_status.to_string(),
                update.last_run_error,
                update.last_run_duration_ms,
                update.next_run_at.map(|t| t.timestamp_millis()),
                update.is_active,
                update.consecutive_failures,
            ],
        )?;
        Ok(n > 0)
    }

    fn insert_run(&self, run: &AutomationRun) -> Result<()> {
        let result = run.result.as_ref().map(serde_json::to_string).transpose()?;
        let messages = run
            .messages
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO automation_runs
             (id, job_id, started_at, completed_at, duration_ms, status,
              error, result, messages, triggered_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.id,
                run.job_id.as_str(),
                run.started_at.timestamp_millis(),
                run.completed_at.timestamp_millis(),
                run.duration_ms,
                run.status.to_string(),
                run.error,
                result,
                messages,
                run.triggered_by.to_string(),
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<AutomationJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM automation_jobs WHERE id = ?1"),
                [job_id.as_str()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }
}

fn ms_to_dt(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_dt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| ms_to_dt(idx, ms))
        .transpose()
}

fn parse_text<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_json(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
        })
        .transpose()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationJob> {
    let last_run_status = match row.get::<_, Option<String>>(16)? {
        Some(_) => Some(parse_text::<RunStatus>(row, 16)?),
        None => None,
    };
    Ok(AutomationJob {
        id: JobId(row.get(0)?),
        org_id: row.get(1)?,
        site_id: row.get(2)?,
        user_id: row.get(3)?,
        name: row.get(4)?,
        trigger_type: parse_text(row, 5)?,
        cron_schedule: row.get(6)?,
        cron_timezone: row.get(7)?,
        next_run_at: opt_dt(row, 8)?,
        run_at: opt_dt(row, 9)?,
        running_at: opt_dt(row, 10)?,
        run_id: row.get::<_, Option<String>>(11)?.map(RunId),
        claimed_by: row.get(12)?,
        lease_expires_at: opt_dt(row, 13)?,
        action_timeout_seconds: row.get(14)?,
        last_run_at: opt_dt(row, 15)?,
        last_run_status,
        last_run_error: row.get(17)?,
        last_run_duration_ms: row.get(18)?,
        consecutive_failures: row.get(19)?,
        is_active: row.get(20)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationRun> {
    Ok(AutomationRun {
        id: row.get(0)?,
        job_id: JobId(row.get(1)?),
        started_at: ms_to_dt(2, row.get(2)?)?,
        completed_at: ms_to_dt(3, row.get(3)?)?,
        duration_ms: row.get(4)?,
        status: parse_text(row, 5)?,
        error: row.get(6)?,
        result: parse_json(row, 7)?,
        messages: parse_json(row, 8)?,
        triggered_by: parse_text(row, 9)?,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Insert `job` verbatim. Job authoring lives outside the engine, so
    /// tests seed rows directly.
    pub fn insert_job(store: &SqliteJobStore, job: &AutomationJob) {
        let conn = store.conn().unwrap();
        conn.execute(
            "INSERT INTO automation_jobs
             (id, org_id, site_id, user_id, name, trigger_type, cron_schedule,
              cron_timezone, next_run_at, run_at, running_at, run_id, claimed_by,
              lease_expires_at, action_timeout_seconds, last_run_at,
              last_run_status, last_run_error, last_run_duration_ms,
              consecutive_failures, is_active)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            params![
                job.id.as_str(),
                job.org_id,
                job.site_id,
                job.user_id,
                job.name,
                job.trigger_type.to_string(),
                job.cron_schedule,
                job.cron_timezone,
                job.next_run_at.map(|t| t.timestamp_millis()),
                job.run_at.map(|t| t.timestamp_millis()),
                job.running_at.map(|t| t.timestamp_millis()),
                job.run_id.as_ref().map(|r| r.as_str().to_string()),
                job.claimed_by,
                job.lease_expires_at.map(|t| t.timestamp_millis()),
                job.action_timeout_seconds,
                job.last_run_at.map(|t| t.timestamp_millis()),
                job.last_run_status.map(|s| s.to_string()),
                job.last_run_error,
                job.last_run_duration_ms,
                job.consecutive_failures,
                job.is_active,
            ],
        )
        .unwrap();
    }

    pub fn insert_domain(store: &SqliteJobStore, site_id: &str, hostname: &str, server_id: Option<&str>) {
        let conn = store.conn().unwrap();
        conn.execute(
            "INSERT INTO domains (site_id, hostname, server_id) VALUES (?1, ?2, ?3)",
            params![site_id, hostname, server_id],
        )
        .unwrap();
    }

    pub fn memory_store() -> SqliteJobStore {
        SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::types::fixtures::job;
    use crate::types::TriggerSource;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn claim_due_jobs_marks_rows_and_skips_claimed() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        insert_job(&store, &job("b"));
        let mut future = job("c");
        future.next_run_at = Some(Utc::now() + ChronoDuration::hours(1));
        insert_job(&store, &future);

        let first = store.claim_due_jobs("srv-1", 10, "srv-1").unwrap();
        assert_eq!(first.len(), 2);
        for j in &first {
            assert_eq!(j.claimed_by.as_deref(), Some("srv-1"));
            assert!(j.run_id.is_some());
            assert!(j.is_claimed(Utc::now()));
        }

        // Already-claimed rows are never handed out twice.
        let second = store.claim_due_jobs("srv-2", 10, "srv-2").unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn batch_claim_mints_the_same_run_id_format_as_single_claims() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        insert_job(&store, &job("b"));

        let claimed = store.claim_due_jobs("srv", 10, "srv").unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.run_id.clone().unwrap()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        for id in &ids {
            let parsed = uuid::Uuid::parse_str(id.as_str()).unwrap();
            assert_eq!(parsed.get_version_num(), 7);
        }
        let stored = store.get_job(&"a".into()).unwrap().unwrap();
        assert!(ids.contains(stored.run_id.as_ref().unwrap()));
    }

    #[test]
    fn count_active_jobs_filters_by_trigger_and_activity() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        let mut off = job("b");
        off.is_active = false;
        insert_job(&store, &off);
        let mut hook = job("c");
        hook.trigger_type = TriggerType::Webhook;
        insert_job(&store, &hook);

        assert_eq!(store.count_active_jobs(TriggerType::Cron).unwrap(), 1);
        assert_eq!(store.count_active_jobs(TriggerType::Webhook).unwrap(), 1);
        assert_eq!(store.count_active_jobs(TriggerType::Email).unwrap(), 0);
    }

    #[test]
    fn claim_due_jobs_respects_limit_and_due_order() {
        let store = memory_store();
        for (i, id) in ["x", "y", "z"].iter().enumerate() {
            let mut j = job(id);
            j.next_run_at = Some(Utc::now() - ChronoDuration::minutes(10 - i as i64));
            insert_job(&store, &j);
        }
        let claimed = store.claim_due_jobs("srv", 2, "srv").unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y"]);
    }

    #[test]
    fn claim_due_jobs_ignores_inactive_and_sites_pinned_elsewhere() {
        let store = memory_store();
        let mut inactive = job("off");
        inactive.is_active = false;
        insert_job(&store, &inactive);
        insert_job(&store, &job("pinned"));
        insert_domain(&store, "site-pinned", "pinned.example.com", Some("srv-other"));
        insert_job(&store, &job("mine"));
        insert_domain(&store, "site-mine", "mine.example.com", Some("srv"));

        let claimed = store.claim_due_jobs("srv", 10, "srv").unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id.as_str(), "mine");
    }

    #[test]
    fn lease_length_follows_action_timeout() {
        let store = memory_store();
        let mut j = job("a");
        j.action_timeout_seconds = 60;
        insert_job(&store, &j);
        let claimed = store.claim_due_jobs("srv", 1, "srv").unwrap();
        let c = &claimed[0];
        let lease = c.lease_expires_at.unwrap() - c.running_at.unwrap();
        assert_eq!(lease.num_seconds(), 60 + LEASE_BUFFER_SECS as i64);
    }

    #[test]
    fn try_claim_is_compare_and_swap() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        let now = Utc::now();
        let claim = |who: &str| ClaimRequest {
            run_id: RunId::new(),
            claimed_by: who.to_string(),
            running_at: now,
            lease_expires_at: now + ChronoDuration::seconds(420),
        };
        assert!(store.try_claim(&JobId::from("a"), &claim("w1")).unwrap());
        assert!(!store.try_claim(&JobId::from("a"), &claim("w2")).unwrap());
        let row = store.get_job(&JobId::from("a")).unwrap().unwrap();
        assert_eq!(row.claimed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn release_with_stale_run_id_keeps_newer_claim() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        let claimed = store.claim_due_jobs("srv", 1, "srv").unwrap();
        let live = claimed[0].run_id.clone().unwrap();

        assert!(!store
            .release_claim(&JobId::from("a"), Some(&RunId::from("stale")))
            .unwrap());
        assert!(store.release_claim(&JobId::from("a"), Some(&live)).unwrap());
        let row = store.get_job(&JobId::from("a")).unwrap().unwrap();
        assert!(row.running_at.is_none());
        assert!(row.run_id.is_none());
        assert!(row.claimed_by.is_none());
        assert!(row.lease_expires_at.is_none());
    }

    #[test]
    fn extend_lease_requires_matching_run_id() {
        let store = memory_store();
        insert_job(&store, &job("a"));
        let claimed = store.claim_due_jobs("srv", 1, "srv").unwrap();
        let lease = Lease {
            job_id: JobId::from("a"),
            run_id: claimed[0].run_id.clone().unwrap(),
        };
        let later = Utc::now() + ChronoDuration::hours(1);
        assert!(store.extend_lease(&lease, later).unwrap());
        let stale = Lease {
            run_id: RunId::from("other"),
            ..lease
        };
        assert!(!store.extend_lease(&stale, later).unwrap());
    }

    #[test]
    fn runs_roundtrip_json_columns() {
        let store = memory_store();
        let now = Utc::now();
        store
            .insert_run(&AutomationRun {
                id: "r1".to_string(),
                job_id: JobId::from("a"),
                started_at: now,
                completed_at: now,
                duration_ms: 12,
                status: RunStatus::Success,
                error: None,
                result: Some(serde_json::json!({ "summary": "done" })),
                messages: Some(serde_json::json!([{ "role": "assistant" }])),
                triggered_by: TriggerSource::Manual,
            })
            .unwrap();
        let runs = store.list_runs(&JobId::from("a"), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].result.as_ref().unwrap()["summary"], "done");
        assert_eq!(runs[0].triggered_by, TriggerSource::Manual);
    }
}
