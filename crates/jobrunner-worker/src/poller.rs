use std::sync::Arc;
use std::time::Duration;

use jobrunner_engine::{claim_due_jobs, FinishResult, JobBackend, RetryPolicy, TriggerSource};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::executor::{execute, Action};

/// Periodically claims due jobs and runs each one on its own task.
pub struct Poller {
    backend: JobBackend,
    action: Arc<dyn Action>,
    server_id: String,
    interval: Duration,
    claim_limit: usize,
    policy: RetryPolicy,
    in_flight: JoinSet<()>,
}

impl Poller {
    pub fn new(
        backend: JobBackend,
        action: Arc<dyn Action>,
        server_id: String,
        interval: Duration,
        claim_limit: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            action,
            server_id,
            interval,
            claim_limit,
            policy,
            in_flight: JoinSet::new(),
        }
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(server_id = %self.server_id, interval_secs = self.interval.as_secs(), "poller started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap();
                    let spawned = self.tick().await;
                    if spawned > 0 {
                        debug!(spawned, in_flight = self.in_flight.len(), "poll tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(in_flight = self.in_flight.len(), "poller shutting down");
                        break;
                    }
                }
            }
        }

        while let Some(res) = self.in_flight.join_next().await {
            if let Err(e) = res {
                error!("run task failed: {e}");
            }
        }
        info!("poller stopped");
    }

    /// Claim one batch and spawn a task per claimed job.
    async fn tick(&mut self) -> usize {
        let contexts = claim_due_jobs(
            &self.backend,
            &self.server_id,
            self.claim_limit,
            TriggerSource::Scheduler,
        )
        .await;

        let spawned = contexts.len();
        for ctx in contexts {
            let action = self.action.clone();
            let policy = self.policy;
            self.in_flight.spawn(async move {
                let job_id = ctx.job_id().clone();
                match execute(ctx, action.as_ref(), policy).await {
                    Ok(FinishResult::Recorded(_)) => {}
                    Ok(FinishResult::Superseded) => {
                        warn!(%job_id, "run outcome discarded; job owned by another run");
                    }
                    Err(e) => error!(%job_id, error = %e, "failed to record run outcome"),
                }
            });
        }
        spawned
    }

    /// Collect tasks that already completed so the set does not grow.
    fn reap(&mut self) {
        while let Some(res) = self.in_flight.try_join_next() {
            if let Err(e) = res {
                error!("run task failed: {e}");
            }
        }
    }
}
