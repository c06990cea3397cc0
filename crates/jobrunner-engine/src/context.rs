use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobrunner_core::{JobId, RunId};

use crate::heartbeat::Heartbeat;
use crate::resolver::HostnameResolver;
use crate::schedule::CronCalculator;
use crate::store::{JobStore, Lease};
use crate::types::{AutomationJob, TriggerSource};

/// The collaborators every engine operation works against.
///
/// Passed explicitly into each call; nothing in the engine reaches for a
/// process-wide client.
#[derive(Clone)]
pub struct JobBackend {
    pub store: Arc<dyn JobStore>,
    pub resolver: Arc<dyn HostnameResolver>,
    pub cron: Arc<dyn CronCalculator>,
}

impl JobBackend {
    pub fn new(
        store: Arc<dyn JobStore>,
        resolver: Arc<dyn HostnameResolver>,
        cron: Arc<dyn CronCalculator>,
    ) -> Self {
        Self {
            store,
            resolver,
            cron,
        }
    }
}

/// A claimed job, from claim until [`crate::finish::finish_job`].
///
/// Owned by whoever claimed the job. Dropping it without finishing stops
/// the heartbeat; the lease then runs out on its own.
pub struct RunContext {
    pub(crate) backend: JobBackend,
    /// Snapshot of the row as claimed (lease columns filled in).
    pub job: AutomationJob,
    pub hostname: String,
    pub run_id: RunId,
    pub claimed_at: DateTime<Utc>,
    pub server_id: String,
    pub timeout_seconds: u32,
    pub triggered_by: TriggerSource,
    pub(crate) heartbeat: Option<Heartbeat>,
}

impl RunContext {
    /// Build the context and start its heartbeat.
    pub(crate) fn start(
        backend: JobBackend,
        job: AutomationJob,
        hostname: String,
        run_id: RunId,
        claimed_at: DateTime<Utc>,
        server_id: String,
        triggered_by: TriggerSource,
    ) -> Self {
        let timeout_seconds = job.action_timeout_seconds;
        let lease = Lease {
            job_id: job.id.clone(),
            run_id: run_id.clone(),
        };
        let heartbeat = Heartbeat::start(backend.store.clone(), lease, timeout_seconds);
        Self {
            backend,
            job,
            hostname,
            run_id,
            claimed_at,
            server_id,
            timeout_seconds,
            triggered_by,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// The ownership token this context's writes are conditioned on.
    pub fn lease(&self) -> Lease {
        Lease {
            job_id: self.job.id.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// False once the heartbeat stopped, e.g. after losing the lease.
    pub fn heartbeat_active(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|hb| !hb.is_finished())
    }

    pub fn backend(&self) -> &JobBackend {
        &self.backend
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("job_id", &self.job.id)
            .field("run_id", &self.run_id)
            .field("hostname", &self.hostname)
            .field("server_id", &self.server_id)
            .field("claimed_at", &self.claimed_at)
            .field("triggered_by", &self.triggered_by)
            .finish()
    }
}
