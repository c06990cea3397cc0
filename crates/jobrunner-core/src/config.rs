use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Lease and retry constants shared by every worker touching the same store.
// Changing them on one worker only skews lease math for the others.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // lease extension cadence
pub const LEASE_BUFFER_SECS: u64 = 120; // slack beyond the action timeout
pub const DEFAULT_ACTION_TIMEOUT_SECS: u32 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 60_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CLAIM_LIMIT: usize = 10;

/// Top-level config (jobrunner.toml + JOBRUNNER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobRunnerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Scheduler loop settings for this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity written to `claimed_by`. Falls back to SERVER_ID / HOSTNAME.
    pub server_id: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum jobs claimed per poll tick.
    #[serde(default = "default_claim_limit")]
    pub claim_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            claim_limit: DEFAULT_CLAIM_LIMIT,
        }
    }
}

/// Failure policy applied when a run finishes unsuccessfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
        }
    }
}

/// Where claimed jobs are sent for execution.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    /// HTTP endpoint receiving one POST per claimed run.
    pub url: Option<String>,
    /// Optional bearer token for the endpoint.
    pub token: Option<String>,
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobrunner/jobrunner.db", home)
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_claim_limit() -> usize {
    DEFAULT_CLAIM_LIMIT
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_base_delay_ms() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

impl JobRunnerConfig {
    /// Load config from a TOML file with JOBRUNNER_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `JOBRUNNER_WORKER__SERVER_ID=worker-a`. A missing file is not an
    /// error: every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: JobRunnerConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("JOBRUNNER_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Worker identity: explicit config first, then the process environment.
    pub fn server_id(&self) -> Option<String> {
        self.worker
            .server_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(crate::types::server_id_from_env)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.jobrunner/jobrunner.toml", home)
}
