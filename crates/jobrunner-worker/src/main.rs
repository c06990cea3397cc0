mod executor;
mod poller;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use jobrunner_core::config::JobRunnerConfig;
use jobrunner_core::JobId;
use jobrunner_engine::{
    claim_job, AutomationJob, ClaimOptions, EngineError, FinishResult, JobBackend, JobStore,
    NoCron, RetryPolicy, SqliteHostnameResolver, SqliteJobStore, TriggerSource, TriggerType,
};
use tracing::{info, warn};

use crate::executor::{execute, Action, HttpAction};
use crate::poller::Poller;

#[derive(Parser)]
#[command(name = "jobrunner-worker", version, about = "Claims and runs scheduled automation jobs")]
struct Cli {
    /// Config file (default: $JOBRUNNER_CONFIG, then ~/.jobrunner/jobrunner.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll for due jobs until Ctrl-C (default)
    Serve,
    /// Claim one job now and run it in the foreground
    Run {
        /// Job id
        job_id: String,
    },
    /// Show recent run history for a job
    Runs {
        /// Job id
        job_id: String,
        /// Number of runs to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobrunner_worker=info,jobrunner_engine=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > JOBRUNNER_CONFIG env > ~/.jobrunner/jobrunner.toml
    let config_path = cli.config.or_else(|| std::env::var("JOBRUNNER_CONFIG").ok());
    let config = JobRunnerConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobRunnerConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    let store = Arc::new(
        SqliteJobStore::open(&db_path)
            .with_context(|| format!("failed to open job database at {db_path}"))?,
    );
    info!(path = %db_path, "job database ready");

    let policy = RetryPolicy {
        max_retries: config.retry.max_retries,
        retry_base_delay_ms: config.retry.retry_base_delay_ms,
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            warn_if_cron_unscheduled(&store);
            let backend = build_backend(&db_path, store)?;
            let action = build_action(&config)?;
            serve(&config, backend, action, policy).await
        }
        Command::Run { job_id } => {
            let backend = build_backend(&db_path, store)?;
            let action = build_action(&config)?;
            run_once(&config, backend, action.as_ref(), policy, JobId::from(job_id)).await
        }
        Command::Runs { job_id, limit } => print_runs(&store, &JobId::from(job_id), limit),
    }
}

async fn serve(
    config: &JobRunnerConfig,
    backend: JobBackend,
    action: Arc<dyn Action>,
    policy: RetryPolicy,
) -> anyhow::Result<()> {
    let server_id = config.server_id().unwrap_or_else(|| {
        warn!("no worker identity configured (worker.server_id, SERVER_ID, HOSTNAME)");
        jobrunner_engine::claim::UNKNOWN_SERVER_ID.to_string()
    });

    let poller = Poller::new(
        backend,
        action,
        server_id,
        Duration::from_secs(config.worker.poll_interval_secs.max(1)),
        config.worker.claim_limit,
        policy,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_task = tokio::spawn(poller.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested; waiting for in-flight runs");
    let _ = shutdown_tx.send(true);
    poller_task.await.context("poller task panicked")?;
    Ok(())
}

async fn run_once(
    config: &JobRunnerConfig,
    backend: JobBackend,
    action: &dyn Action,
    policy: RetryPolicy,
    job_id: JobId,
) -> anyhow::Result<()> {
    let job = load_job(backend.store.as_ref(), &job_id)?;

    let mut opts = ClaimOptions::new(TriggerSource::Manual);
    if let Some(server_id) = config.server_id() {
        opts = opts.server_id(server_id);
    }
    let Some(ctx) = claim_job(&backend, &job, opts).await else {
        bail!("job {job_id} could not be claimed (already running, or its site has no hostname)");
    };

    match execute(ctx, action, policy).await? {
        FinishResult::Recorded(plan) => {
            let next = plan
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "{job_id}: recorded (next run: {next}, active: {}, failures: {})",
                plan.is_active, plan.consecutive_failures
            );
        }
        FinishResult::Superseded => {
            println!("{job_id}: outcome discarded, job was taken over by another run");
        }
    }
    Ok(())
}

fn load_job(store: &dyn JobStore, job_id: &JobId) -> Result<AutomationJob, EngineError> {
    store.get_job(job_id)?.ok_or_else(|| EngineError::JobNotFound {
        id: job_id.to_string(),
    })
}

fn print_runs(store: &SqliteJobStore, job_id: &JobId, limit: usize) -> anyhow::Result<()> {
    let runs = store.list_runs(job_id, limit)?;
    if runs.is_empty() {
        println!("no runs recorded for {job_id}");
        return Ok(());
    }
    for run in runs {
        let detail = run
            .result
            .as_ref()
            .and_then(|r| r.get("summary"))
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .or(run.error)
            .unwrap_or_default();
        println!(
            "{}  {:<7}  {:>7}ms  {:<9}  {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.status.to_string(),
            run.duration_ms,
            run.triggered_by.to_string(),
            detail
        );
    }
    Ok(())
}

/// The binary has no cron calculator, so cron jobs stop after their next
/// run. Say so once at startup. Returns the number of affected jobs.
fn warn_if_cron_unscheduled(store: &SqliteJobStore) -> usize {
    match store.count_active_jobs(TriggerType::Cron) {
        Ok(0) => 0,
        Ok(count) => {
            warn!(
                count,
                "active cron jobs found but no cron calculator is configured; \
                 each will run once more and then get no next run"
            );
            count
        }
        Err(e) => {
            warn!(error = %e, "could not count cron jobs");
            0
        }
    }
}

fn build_backend(db_path: &str, store: Arc<SqliteJobStore>) -> anyhow::Result<JobBackend> {
    let resolver_conn = rusqlite::Connection::open(db_path)
        .with_context(|| format!("failed to open resolver connection to {db_path}"))?;
    let resolver = SqliteHostnameResolver::new(resolver_conn)?;
    Ok(JobBackend::new(store, Arc::new(resolver), Arc::new(NoCron)))
}

fn build_action(config: &JobRunnerConfig) -> anyhow::Result<Arc<dyn Action>> {
    let Some(url) = config.executor.url.clone().filter(|u| !u.trim().is_empty()) else {
        bail!("executor.url is not configured (set it in the config file or JOBRUNNER_EXECUTOR__URL)");
    };
    info!(%url, "using HTTP executor");
    Ok(Arc::new(HttpAction::new(url, config.executor.token.clone())))
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
