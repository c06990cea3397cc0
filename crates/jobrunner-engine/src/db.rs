use rusqlite::Connection;

use crate::error::Result;

/// Initialise the automation schema in `conn`.
///
/// Creates `automation_jobs`, `automation_runs` and `domains` (idempotent).
/// All timestamps are epoch milliseconds so range predicates compare
/// integers rather than RFC 3339 strings.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS automation_jobs (
            id                      TEXT    NOT NULL PRIMARY KEY,
            org_id                  TEXT    NOT NULL,
            site_id                 TEXT    NOT NULL,
            user_id                 TEXT    NOT NULL,
            name                    TEXT    NOT NULL DEFAULT '',
            trigger_type            TEXT    NOT NULL,   -- cron | webhook | one-time | email
            cron_schedule           TEXT,
            cron_timezone           TEXT,
            next_run_at             INTEGER,
            run_at                  INTEGER,
            running_at              INTEGER,            -- NULL = not claimed
            run_id                  TEXT,               -- lease ownership token
            claimed_by              TEXT,
            lease_expires_at        INTEGER,
            action_timeout_seconds  INTEGER NOT NULL DEFAULT 300,
            last_run_at             INTEGER,
            last_run_status         TEXT,
            last_run_error          TEXT,
            last_run_duration_ms    INTEGER,
            consecutive_failures    INTEGER NOT NULL DEFAULT 0,
            is_active               INTEGER NOT NULL DEFAULT 1
        ) STRICT;

        -- Polling: WHERE is_active = 1 AND running_at IS NULL AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_automation_jobs_due
            ON automation_jobs (is_active, next_run_at);

        CREATE TABLE IF NOT EXISTS automation_runs (
            id            TEXT    NOT NULL PRIMARY KEY,
            job_id        TEXT    NOT NULL,
            started_at    INTEGER NOT NULL,
            completed_at  INTEGER NOT NULL,
            duration_ms   INTEGER NOT NULL,
            status        TEXT    NOT NULL,
            error         TEXT,
            result        TEXT,               -- JSON or NULL
            messages      TEXT,               -- JSON or NULL
            triggered_by  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_automation_runs_job
            ON automation_runs (job_id, started_at DESC);

        -- Site → hostname mapping. server_id pins a site to one worker.
        CREATE TABLE IF NOT EXISTS domains (
            site_id    TEXT NOT NULL PRIMARY KEY,
            hostname   TEXT NOT NULL,
            server_id  TEXT
        ) STRICT;
        ",
    )?;
    Ok(())
}
