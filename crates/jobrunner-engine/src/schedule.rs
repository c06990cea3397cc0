use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::debug;

use crate::types::{AutomationJob, RunStatus, TriggerType};

/// Upper bound of the random jitter added to a retry delay, as a fraction
/// of the un-jittered delay.
const RETRY_JITTER_FRACTION: f64 = 0.2;

/// Longest delay a failed job is pushed back by, jitter included.
pub const MAX_RETRY_DELAY_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Cron math lives outside the engine; this is the seam it is called through.
///
/// Implementations get the job's schedule and timezone exactly as stored
/// and return the first occurrence strictly after `now`, or `None` when
/// there is none (or the expression cannot be evaluated).
pub trait CronCalculator: Send + Sync {
    fn next_run_at(
        &self,
        schedule: &str,
        timezone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

impl<F> CronCalculator for F
where
    F: Fn(&str, Option<&str>, DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync,
{
    fn next_run_at(
        &self,
        schedule: &str,
        timezone: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self(schedule, timezone, now)
    }
}

/// Calculator for deployments without a cron engine wired in: every cron
/// job finishes with no next run. Callers wiring it should warn once at
/// startup; per-run calls only log at debug.
pub struct NoCron;

impl CronCalculator for NoCron {
    fn next_run_at(
        &self,
        schedule: &str,
        _timezone: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        debug!(%schedule, "no cron calculator configured; next_run_at will not be set");
        None
    }
}

/// Retry policy applied on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures after which the job is deactivated.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: jobrunner_core::config::DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: jobrunner_core::config::DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

/// Scheduling state a finished run leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct NextRunPlan {
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub consecutive_failures: u32,
}

/// Decide what happens to `job` after a run ending in `status` at `now`.
///
/// | Outcome                          | next_run_at              | is_active |
/// |----------------------------------|--------------------------|-----------|
/// | success, one-time                | None                     | false     |
/// | success, cron                    | calculator(now)          | unchanged |
/// | success, webhook/email           | unchanged                | unchanged |
/// | failure, failures >= max_retries | None                     | false     |
/// | failure, otherwise               | now + backoff + jitter   | unchanged |
pub fn plan_next_run(
    job: &AutomationJob,
    status: RunStatus,
    policy: RetryPolicy,
    cron: &dyn CronCalculator,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> NextRunPlan {
    match status {
        RunStatus::Success => {
            let (next_run_at, is_active) = match job.trigger_type {
                TriggerType::OneTime => (None, false),
                TriggerType::Cron => {
                    let next = job.cron_schedule.as_deref().and_then(|schedule| {
                        cron.next_run_at(schedule, job.cron_timezone.as_deref(), now)
                    });
                    (next, job.is_active)
                }
                TriggerType::Webhook | TriggerType::Email => (job.next_run_at, job.is_active),
            };
            NextRunPlan {
                next_run_at,
                is_active,
                consecutive_failures: 0,
            }
        }
        RunStatus::Failure => {
            let failures = job.consecutive_failures.saturating_add(1);
            if failures >= policy.max_retries {
                return NextRunPlan {
                    next_run_at: None,
                    is_active: false,
                    consecutive_failures: failures,
                };
            }
            let delay = retry_delay_ms(policy.retry_base_delay_ms, failures, rng);
            NextRunPlan {
                next_run_at: Some(
                    now.checked_add_signed(Duration::milliseconds(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                ),
                is_active: job.is_active,
                consecutive_failures: failures,
            }
        }
    }
}

/// `base * 2^(failures-1)` plus up to 20 % jitter, in milliseconds,
/// capped at [`MAX_RETRY_DELAY_MS`].
pub fn retry_delay_ms(base_ms: u64, failures: u32, rng: &mut impl Rng) -> i64 {
    let exponent = failures.saturating_sub(1);
    let base = 1u64
        .checked_shl(exponent)
        .and_then(|factor| base_ms.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY_MS, |ms| {
            i64::try_from(ms).unwrap_or(MAX_RETRY_DELAY_MS).min(MAX_RETRY_DELAY_MS)
        });
    let jitter = rng.random::<f64>() * RETRY_JITTER_FRACTION * base as f64;
    (base as f64 + jitter).floor().min(MAX_RETRY_DELAY_MS as f64) as i64
}
