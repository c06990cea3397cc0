use chrono::{Duration, Utc};
use jobrunner_core::types::server_id_from_env;
use jobrunner_core::RunId;
use tracing::{debug, error, info, warn};

use crate::context::{JobBackend, RunContext};
use crate::heartbeat::lease_duration;
use crate::store::ClaimRequest;
use crate::types::{AutomationJob, TriggerSource};

/// `claimed_by` written when neither the caller nor the environment names
/// this process.
pub const UNKNOWN_SERVER_ID: &str = "unknown";

/// Options for [`claim_job`].
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    /// Defaults to the process identity (`SERVER_ID` / `HOSTNAME`).
    pub server_id: Option<String>,
    /// Defaults to the job's action timeout plus the lease buffer.
    pub lease_duration_seconds: Option<u32>,
    pub triggered_by: TriggerSource,
}

impl ClaimOptions {
    pub fn new(triggered_by: TriggerSource) -> Self {
        Self {
            server_id: None,
            lease_duration_seconds: None,
            triggered_by,
        }
    }

    pub fn server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn lease_duration_seconds(mut self, secs: u32) -> Self {
        self.lease_duration_seconds = Some(secs);
        self
    }
}

/// Claim up to `limit` due jobs for `server_id` in one store round-trip.
///
/// Jobs whose site has no hostname are released and dropped. A failing
/// store yields an empty list; the next poll tick simply tries again.
pub async fn claim_due_jobs(
    backend: &JobBackend,
    server_id: &str,
    limit: usize,
    triggered_by: TriggerSource,
) -> Vec<RunContext> {
    let jobs = match backend.store.claim_due_jobs(server_id, limit, server_id) {
        Ok(jobs) => jobs,
        Err(e) => {
            error!(%server_id, error = %e, "claim_due_jobs failed; nothing claimed this cycle");
            return Vec::new();
        }
    };

    let mut contexts = Vec::with_capacity(jobs.len());
    for job in jobs {
        let Some(run_id) = job.run_id.clone() else {
            warn!(job_id = %job.id, "store returned a claimed job without run id; releasing");
            release(backend, &job, None);
            continue;
        };
        let Some(hostname) = resolve_or_release(backend, &job, &run_id).await else {
            continue;
        };
        let claimed_at = job.running_at.unwrap_or_else(Utc::now);
        info!(job_id = %job.id, %run_id, %hostname, name = %job.name, "job claimed");
        contexts.push(RunContext::start(
            backend.clone(),
            job,
            hostname,
            run_id,
            claimed_at,
            server_id.to_string(),
            triggered_by,
        ));
    }
    contexts
}

/// Claim one specific job, typically for a manual "run now".
///
/// Returns `None` when someone else holds the job, when the claim write
/// fails, or when the job's site cannot be resolved (the claim is then
/// released again).
pub async fn claim_job(
    backend: &JobBackend,
    job: &AutomationJob,
    opts: ClaimOptions,
) -> Option<RunContext> {
    let server_id = opts
        .server_id
        .or_else(server_id_from_env)
        .unwrap_or_else(|| UNKNOWN_SERVER_ID.to_string());
    let lease = match opts.lease_duration_seconds {
        Some(secs) => Duration::seconds(i64::from(secs)),
        None => lease_duration(job.action_timeout_seconds),
    };
    let now = Utc::now();
    let claim = ClaimRequest {
        run_id: RunId::new(),
        claimed_by: server_id.clone(),
        running_at: now,
        lease_expires_at: now + lease,
    };

    match backend.store.try_claim(&job.id, &claim) {
        Ok(true) => {}
        Ok(false) => {
            debug!(job_id = %job.id, "job already claimed elsewhere");
            return None;
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "claim failed");
            return None;
        }
    }

    let mut claimed = job.clone();
    claimed.running_at = Some(claim.running_at);
    claimed.run_id = Some(claim.run_id.clone());
    claimed.claimed_by = Some(claim.claimed_by);
    claimed.lease_expires_at = Some(claim.lease_expires_at);

    let hostname = resolve_or_release(backend, &claimed, &claim.run_id).await?;
    info!(job_id = %job.id, run_id = %claim.run_id, %hostname, triggered_by = %opts.triggered_by, "job claimed");
    Some(RunContext::start(
        backend.clone(),
        claimed,
        hostname,
        claim.run_id,
        now,
        server_id,
        opts.triggered_by,
    ))
}

/// Resolve the job's hostname; on any failure give the claim back.
async fn resolve_or_release(
    backend: &JobBackend,
    job: &AutomationJob,
    run_id: &RunId,
) -> Option<String> {
    match backend.resolver.resolve_hostname(&job.site_id).await {
        Ok(Some(hostname)) => Some(hostname),
        Ok(None) => {
            warn!(job_id = %job.id, site_id = %job.site_id, "no hostname for site; releasing claim");
            release(backend, job, Some(run_id));
            None
        }
        Err(e) => {
            warn!(job_id = %job.id, site_id = %job.site_id, error = %e, "hostname lookup failed; releasing claim");
            release(backend, job, Some(run_id));
            None
        }
    }
}

fn release(backend: &JobBackend, job: &AutomationJob, run_id: Option<&RunId>) {
    match backend.store.release_claim(&job.id, run_id) {
        Ok(true) => debug!(job_id = %job.id, "claim released"),
        Ok(false) => warn!(job_id = %job.id, "claim already gone when releasing"),
        // The lease will expire on its own.
        Err(e) => error!(job_id = %job.id, error = %e, "failed to release claim"),
    }
}
