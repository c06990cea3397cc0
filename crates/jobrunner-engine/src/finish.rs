use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::error::Result;
use crate::schedule::{plan_next_run, NextRunPlan, RetryPolicy};
use crate::store::FinishUpdate;
use crate::types::{AutomationRun, RunStatus};

/// How a run ended, as reported by the executor.
#[derive(Debug, Clone)]
pub struct FinishOutcome {
    pub status: RunStatus,
    pub duration_ms: i64,
    pub error: Option<String>,
    /// Human-readable one-liner; see [`crate::summary::extract_summary`].
    pub summary: Option<String>,
    /// Raw message log, stored verbatim on the history row.
    pub messages: Option<serde_json::Value>,
    /// Overrides [`RetryPolicy::default`] (3).
    pub max_retries: Option<u32>,
    /// Overrides [`RetryPolicy::default`] (60 000 ms).
    pub retry_base_delay_ms: Option<u64>,
}

impl FinishOutcome {
    pub fn success(duration_ms: i64) -> Self {
        Self {
            status: RunStatus::Success,
            duration_ms,
            error: None,
            summary: None,
            messages: None,
            max_retries: None,
            retry_base_delay_ms: None,
        }
    }

    pub fn failure(duration_ms: i64, error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            error: Some(error.into()),
            ..Self::success(duration_ms)
        }
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_messages(mut self, messages: serde_json::Value) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.max_retries = Some(policy.max_retries);
        self.retry_base_delay_ms = Some(policy.retry_base_delay_ms);
        self
    }

    fn policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_base_delay_ms: self.retry_base_delay_ms.unwrap_or(defaults.retry_base_delay_ms),
        }
    }
}

/// What [`finish_job`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishResult {
    /// The row was updated and (best effort) a history record written.
    Recorded(NextRunPlan),
    /// Another runner owns the row now; nothing was written.
    Superseded,
}

/// Finalise a run: stop the heartbeat, write the outcome and the next
/// schedule to the job row (only if this context still owns it) and
/// append a history record.
///
/// `Err` is returned only when the job-row update itself fails; the lease
/// then expires on its own. A failing history insert is logged and
/// ignored, since the job row is the authoritative state.
pub fn finish_job(mut ctx: RunContext, outcome: FinishOutcome) -> Result<FinishResult> {
    // No lease extension may race with the final write.
    if let Some(hb) = ctx.heartbeat.take() {
        hb.stop();
    }

    let now = Utc::now();
    let plan = plan_next_run(
        &ctx.job,
        outcome.status,
        outcome.policy(),
        ctx.backend.cron.as_ref(),
        now,
        &mut rand::rng(),
    );

    let update = FinishUpdate {
        // When the run started, not when it ended.
        last_run_at: ctx.claimed_at,
        last_run_status: outcome.status,
        last_run_error: outcome.error.clone(),
        last_run_duration_ms: outcome.duration_ms,
        next_run_at: plan.next_run_at,
        is_active: plan.is_active,
        consecutive_failures: plan.consecutive_failures,
    };

    let lease = ctx.lease();
    if !ctx.backend.store.finish_run(&lease, &update)? {
        warn!(
            job_id = %lease.job_id,
            run_id = %lease.run_id,
            "run id no longer matches; another runner took over, skipping finish"
        );
        return Ok(FinishResult::Superseded);
    }

    if !plan.is_active && outcome.status == RunStatus::Failure {
        warn!(
            job_id = %lease.job_id,
            failures = plan.consecutive_failures,
            "job disabled after repeated failures"
        );
    }
    info!(
        job_id = %lease.job_id,
        run_id = %lease.run_id,
        status = %outcome.status,
        duration_ms = outcome.duration_ms,
        next_run_at = ?plan.next_run_at,
        "run finished"
    );

    let run = AutomationRun {
        id: Uuid::new_v4().to_string(),
        job_id: lease.job_id.clone(),
        started_at: ctx.claimed_at,
        completed_at: now,
        duration_ms: outcome.duration_ms,
        status: outcome.status,
        error: outcome.error,
        result: outcome.summary.map(|summary| json!({ "summary": summary })),
        messages: outcome.messages,
        triggered_by: ctx.triggered_by,
    };
    if let Err(e) = ctx.backend.store.insert_run(&run) {
        error!(job_id = %lease.job_id, run_id = %lease.run_id, error = %e, "failed to insert run history");
    }

    Ok(FinishResult::Recorded(plan))
}
