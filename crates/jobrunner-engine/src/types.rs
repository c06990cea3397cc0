use chrono::{DateTime, Utc};
use jobrunner_core::{JobId, RunId};
use serde::{Deserialize, Serialize};

/// What causes a job to become due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerType {
    /// Recurring; `next_run_at` follows the cron schedule.
    Cron,
    /// Fired by an inbound webhook.
    Webhook,
    /// Runs once at `run_at`, then deactivates on success.
    OneTime,
    /// Fired by an inbound email.
    Email,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Cron => "cron",
            TriggerType::Webhook => "webhook",
            TriggerType::OneTime => "one-time",
            TriggerType::Email => "email",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TriggerType::Cron),
            "webhook" => Ok(TriggerType::Webhook),
            "one-time" => Ok(TriggerType::OneTime),
            "email" => Ok(TriggerType::Email),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Who asked for a run. Recorded on the history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The periodic poll loop.
    Scheduler,
    /// A person pressed "run now".
    Manual,
    /// Another subsystem (webhook/email ingestion, internal API).
    Internal,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(TriggerSource::Scheduler),
            "manual" => Ok(TriggerSource::Manual),
            "internal" => Ok(TriggerSource::Internal),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// Display state derived from the lease and lifecycle columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Paused,
    /// Deactivated by the retry policy after repeated failures.
    Disabled,
}

/// A persisted automation job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationJob {
    pub id: JobId,
    pub org_id: String,
    pub site_id: String,
    pub user_id: String,
    /// Human-readable label, used in logs only.
    pub name: String,
    pub trigger_type: TriggerType,
    pub cron_schedule: Option<String>,
    pub cron_timezone: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_at: Option<DateTime<Utc>>,
    /// Set while claimed; NULL means nobody holds the job.
    pub running_at: Option<DateTime<Utc>>,
    pub run_id: Option<RunId>,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub action_timeout_seconds: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
    pub last_run_duration_ms: Option<i64>,
    pub consecutive_failures: u32,
    pub is_active: bool,
}

impl AutomationJob {
    /// True while another runner holds a lease that has not yet expired.
    ///
    /// A row with `running_at` set but an expired lease belongs to a crashed
    /// holder. It counts as unclaimed here, but nothing clears its columns.
    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        self.running_at.is_some()
            && self.run_id.is_some()
            && self.lease_expires_at.is_some_and(|exp| exp > now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> JobStatus {
        if self.is_claimed(now) {
            JobStatus::Running
        } else if !self.is_active && self.last_run_status == Some(RunStatus::Failure) {
            JobStatus::Disabled
        } else if !self.is_active {
            JobStatus::Paused
        } else {
            JobStatus::Idle
        }
    }
}

/// A historical run record. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: String,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub error: Option<String>,
    /// `{"summary": ...}` when a summary was available.
    pub result: Option<serde_json::Value>,
    /// Raw message log handed over by the executor.
    pub messages: Option<serde_json::Value>,
    pub triggered_by: TriggerSource,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// An active cron job nobody holds, due now.
    pub fn job(id: &str) -> AutomationJob {
        AutomationJob {
            id: JobId::from(id),
            org_id: "org-1".to_string(),
            site_id: format!("site-{id}"),
            user_id: "user-1".to_string(),
            name: format!("job {id}"),
            trigger_type: TriggerType::Cron,
            cron_schedule: Some("*/5 * * * *".to_string()),
            cron_timezone: Some("Europe/Amsterdam".to_string()),
            next_run_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            run_at: None,
            running_at: None,
            run_id: None,
            claimed_by: None,
            lease_expires_at: None,
            action_timeout_seconds: 300,
            last_run_at: None,
            last_run_status: None,
            last_run_error: None,
            last_run_duration_ms: None,
            consecutive_failures: 0,
            is_active: true,
        }
    }
}
