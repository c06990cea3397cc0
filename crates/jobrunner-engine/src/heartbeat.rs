use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobrunner_core::config::{HEARTBEAT_INTERVAL_SECS, LEASE_BUFFER_SECS};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::store::{JobStore, Lease};

/// Lease length for an action allowed to run `timeout_seconds`.
pub fn lease_duration(timeout_seconds: u32) -> chrono::Duration {
    chrono::Duration::seconds(i64::from(timeout_seconds) + LEASE_BUFFER_SECS as i64)
}

/// Background task that keeps one run's lease alive.
///
/// Every tick pushes `lease_expires_at` to `now + timeout + buffer`, but
/// only while the row's run id still matches. A mismatch means the job was
/// finished or taken over elsewhere and the task ends itself. Store errors
/// are logged and retried on the next tick.
///
/// The task is aborted on [`Heartbeat::stop`] and on drop, so a context
/// that is discarded without finishing never leaks a timer.
pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start extending `lease` every [`HEARTBEAT_INTERVAL_SECS`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(store: Arc<dyn JobStore>, lease: Lease, timeout_seconds: u32) -> Self {
        Self::with_interval(
            store,
            lease,
            timeout_seconds,
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        )
    }

    pub fn with_interval(
        store: Arc<dyn JobStore>,
        lease: Lease,
        timeout_seconds: u32,
        every: Duration,
    ) -> Self {
        let handle = tokio::spawn(run(store, lease, timeout_seconds, every));
        Self { handle }
    }

    /// True once the task ended on its own (run id mismatch) or was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(store: Arc<dyn JobStore>, lease: Lease, timeout_seconds: u32, every: Duration) {
    // First extension one interval after the claim; the claim itself set
    // a full-length lease.
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let expires_at = Utc::now() + lease_duration(timeout_seconds);
        match store.extend_lease(&lease, expires_at) {
            Ok(true) => {
                debug!(job_id = %lease.job_id, run_id = %lease.run_id, %expires_at, "lease extended");
            }
            Ok(false) => {
                warn!(
                    job_id = %lease.job_id,
                    run_id = %lease.run_id,
                    "run id no longer matches; stopping heartbeat"
                );
                break;
            }
            Err(e) => {
                warn!(job_id = %lease.job_id, run_id = %lease.run_id, error = %e, "heartbeat failed");
            }
        }
    }
}
