//! `jobrunner-engine` - lease-based claim / execute / finish for automation jobs.
//!
//! # Overview
//!
//! Several worker processes may poll the same store at once. All exclusion
//! comes from the store: a batch claim marks rows in the same atomic step
//! that selects them, and every later write (heartbeat, release, finish) is
//! a compare-and-swap on the run id handed out at claim time.
//!
//! # Lifecycle
//!
//! | Step                         | Store write                                   |
//! |------------------------------|-----------------------------------------------|
//! | [`claim_due_jobs`]           | atomic batch claim (`BEGIN IMMEDIATE`)        |
//! | [`claim_job`]                | `… WHERE running_at IS NULL`                  |
//! | heartbeat (every 30 s)       | `lease_expires_at … WHERE run_id = ?`         |
//! | [`finish_job`]               | outcome + next run `… WHERE run_id = ?`       |
//!
//! Leases held by a crashed worker expire but are not reclaimed
//! automatically; such rows keep `running_at` set until cleared by hand.

pub mod claim;
pub mod context;
pub mod db;
pub mod error;
pub mod finish;
pub mod heartbeat;
pub mod resolver;
pub mod schedule;
pub mod store;
pub mod summary;
pub mod types;

pub use claim::{claim_due_jobs, claim_job, ClaimOptions};
pub use context::{JobBackend, RunContext};
pub use error::{EngineError, Result};
pub use finish::{finish_job, FinishOutcome, FinishResult};
pub use resolver::{HostnameResolver, SqliteHostnameResolver, StaticResolver};
pub use schedule::{CronCalculator, NoCron, RetryPolicy};
pub use store::{JobStore, Lease, SqliteJobStore};
pub use summary::extract_summary;
pub use types::{AutomationJob, AutomationRun, JobStatus, RunStatus, TriggerSource, TriggerType};
