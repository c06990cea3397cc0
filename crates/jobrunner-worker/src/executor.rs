use std::time::Duration;

use async_trait::async_trait;
use jobrunner_engine::{
    extract_summary, finish_job, FinishOutcome, FinishResult, RetryPolicy, RunContext,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What an action reports back for one run.
#[derive(Debug, Clone, Default)]
pub struct ActionOutput {
    pub ok: bool,
    /// Free-form text; its first line becomes the run summary.
    pub output: Option<String>,
    pub error: Option<String>,
    pub messages: Option<serde_json::Value>,
}

impl ActionOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            ok: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Does the actual work for a claimed job.
///
/// Implementations must not write to the job row; [`execute`] records the
/// outcome once the action returns.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &RunContext) -> ActionOutput;
}

/// Run `action` for `ctx` under the job's timeout and record the outcome.
///
/// Consumes the context: whatever happens, the heartbeat is stopped and the
/// lease is either released by [`finish_job`] or left to expire.
pub async fn execute(
    ctx: RunContext,
    action: &dyn Action,
    policy: RetryPolicy,
) -> jobrunner_engine::Result<FinishResult> {
    let timeout = Duration::from_secs(u64::from(ctx.timeout_seconds));
    let started = Instant::now();

    let output = match tokio::time::timeout(timeout, action.run(&ctx)).await {
        Ok(output) => output,
        Err(_) => {
            warn!(job_id = %ctx.job_id(), run_id = %ctx.run_id, timeout_secs = ctx.timeout_seconds, "action timed out");
            ActionOutput::failure(format!(
                "action timed out after {}s",
                ctx.timeout_seconds
            ))
        }
    };
    let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

    let job_id = ctx.job_id().clone();
    let outcome = outcome_from_output(output, duration_ms, policy);
    let status = outcome.status;
    let result = finish_job(ctx, outcome)?;
    info!(%job_id, %status, duration_ms, "run finished");
    Ok(result)
}

/// Translate an action's report into what gets recorded.
pub fn outcome_from_output(
    output: ActionOutput,
    duration_ms: i64,
    policy: RetryPolicy,
) -> FinishOutcome {
    let summary = output
        .output
        .as_deref()
        .and_then(extract_summary)
        .or_else(|| output.error.as_deref().and_then(extract_summary));

    let outcome = if output.ok {
        FinishOutcome::success(duration_ms)
    } else {
        let error = output
            .error
            .unwrap_or_else(|| "action reported failure".to_string());
        FinishOutcome::failure(duration_ms, error)
    };

    let outcome = outcome.with_summary(summary).with_policy(policy);
    match output.messages {
        Some(messages) => outcome.with_messages(messages),
        None => outcome,
    }
}

// ── HTTP executor ──────────────────────────────────────────────────────────

/// Body POSTed to the executor endpoint for each run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    job_id: &'a str,
    job_name: &'a str,
    site_id: &'a str,
    hostname: &'a str,
    run_id: &'a str,
    triggered_by: String,
    timeout_seconds: u32,
}

/// What the executor endpoint may answer with. Every field is optional;
/// a 2xx with an empty body counts as success.
#[derive(Debug, Default, Deserialize)]
struct RunResponse {
    ok: Option<bool>,
    output: Option<String>,
    error: Option<String>,
    messages: Option<serde_json::Value>,
}

/// Hands each run to an HTTP endpoint and waits for its verdict.
pub struct HttpAction {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpAction {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl Action for HttpAction {
    async fn run(&self, ctx: &RunContext) -> ActionOutput {
        let body = RunRequest {
            job_id: ctx.job_id().as_str(),
            job_name: &ctx.job.name,
            site_id: &ctx.job.site_id,
            hostname: &ctx.hostname,
            run_id: ctx.run_id.as_str(),
            triggered_by: ctx.triggered_by.to_string(),
            timeout_seconds: ctx.timeout_seconds,
        };

        debug!(job_id = %ctx.job_id(), url = %self.url, "posting run to executor");

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return ActionOutput::failure(format!("executor request failed: {e}")),
        };
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(text) => response_to_output(status, &text),
            Err(e) => ActionOutput::failure(format!("failed to read executor response: {e}")),
        }
    }
}

/// Map an executor HTTP response onto an [`ActionOutput`].
fn response_to_output(status: u16, body: &str) -> ActionOutput {
    if !(200..300).contains(&status) {
        let detail = extract_summary(body).unwrap_or_default();
        let error = if detail.is_empty() {
            format!("executor returned HTTP {status}")
        } else {
            format!("executor returned HTTP {status}: {detail}")
        };
        return ActionOutput::failure(error);
    }

    if body.trim().is_empty() {
        return ActionOutput {
            ok: true,
            ..ActionOutput::default()
        };
    }

    match serde_json::from_str::<RunResponse>(body) {
        Ok(parsed) => ActionOutput {
            ok: parsed.ok.unwrap_or(parsed.error.is_none()),
            output: parsed.output,
            error: parsed.error,
            messages: parsed.messages,
        },
        // Plain-text bodies are taken as the run's output.
        Err(_) => ActionOutput::success(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestDb;
    use jobrunner_engine::{claim_job, ClaimOptions, JobStore, RunStatus, TriggerSource};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(ActionOutput);

    #[async_trait]
    impl Action for Fixed {
        async fn run(&self, _ctx: &RunContext) -> ActionOutput {
            self.0.clone()
        }
    }

    struct Slow {
        started: AtomicUsize,
    }

    #[async_trait]
    impl Action for Slow {
        async fn run(&self, _ctx: &RunContext) -> ActionOutput {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ActionOutput::success("never")
        }
    }

    async fn claimed(db: &TestDb, id: &str, timeout_secs: u32) -> RunContext {
        db.seed_job(id, "site-1", timeout_secs);
        db.seed_domain("site-1", "one.example.com");
        let backend = db.backend();
        let job = backend.store.get_job(&id.into()).unwrap().unwrap();
        claim_job(&backend, &job, ClaimOptions::new(TriggerSource::Manual).server_id("test"))
            .await
            .expect("claim")
    }

    #[test]
    fn success_summary_comes_from_first_output_line() {
        let outcome = outcome_from_output(
            ActionOutput::success("\n  Published 3 posts  \nsecond line"),
            12,
            RetryPolicy::default(),
        );
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.summary.as_deref(), Some("Published 3 posts"));
        assert_eq!(outcome.duration_ms, 12);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn failure_without_error_text_gets_a_generic_one() {
        let outcome = outcome_from_output(
            ActionOutput {
                ok: false,
                ..ActionOutput::default()
            },
            1,
            RetryPolicy::default(),
        );
        assert_eq!(outcome.status, RunStatus::Failure);
        assert_eq!(outcome.error.as_deref(), Some("action reported failure"));
    }

    #[test]
    fn configured_policy_is_carried_into_outcome() {
        let policy = RetryPolicy {
            max_retries: 5,
            retry_base_delay_ms: 1_000,
        };
        let outcome = outcome_from_output(ActionOutput::failure("boom"), 1, policy);
        assert_eq!(outcome.max_retries, Some(5));
        assert_eq!(outcome.retry_base_delay_ms, Some(1_000));
        assert_eq!(outcome.summary.as_deref(), Some("boom"));
    }

    #[test]
    fn http_error_status_is_a_failure() {
        let out = response_to_output(502, "Bad Gateway\n<html>...");
        assert!(!out.ok);
        assert_eq!(out.error.as_deref(), Some("executor returned HTTP 502: Bad Gateway"));

        let out = response_to_output(500, "");
        assert_eq!(out.error.as_deref(), Some("executor returned HTTP 500"));
    }

    #[test]
    fn json_response_is_parsed() {
        let body = json!({
            "ok": true,
            "output": "done",
            "messages": [{"role": "assistant", "content": "done"}]
        })
        .to_string();
        let out = response_to_output(200, &body);
        assert!(out.ok);
        assert_eq!(out.output.as_deref(), Some("done"));
        assert!(out.messages.is_some());
    }

    #[test]
    fn json_error_without_ok_flag_is_a_failure() {
        let out = response_to_output(200, r#"{"error":"site unreachable"}"#);
        assert!(!out.ok);
        assert_eq!(out.error.as_deref(), Some("site unreachable"));
    }

    #[test]
    fn empty_and_plain_bodies_succeed() {
        assert!(response_to_output(204, "").ok);
        let out = response_to_output(200, "all good");
        assert!(out.ok);
        assert_eq!(out.output.as_deref(), Some("all good"));
    }

    #[tokio::test]
    async fn execute_records_success_and_history() {
        let db = TestDb::new();
        let ctx = claimed(&db, "a", 300).await;
        let run_id = ctx.run_id.clone();

        let action = Fixed(ActionOutput::success("Sent newsletter"));
        let result = execute(ctx, &action, RetryPolicy::default()).await.unwrap();
        assert!(matches!(result, FinishResult::Recorded(_)));

        let store = db.store();
        let row = store.get_job(&"a".into()).unwrap().unwrap();
        assert_eq!(row.last_run_status, Some(RunStatus::Success));
        assert!(row.run_id.is_none());
        assert!(row.running_at.is_none());

        let runs = store.list_runs(&"a".into(), 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].triggered_by, TriggerSource::Manual);
        assert_eq!(
            runs[0].result.as_ref().and_then(|r| r["summary"].as_str()),
            Some("Sent newsletter")
        );
        assert_ne!(runs[0].id, run_id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn execute_fails_the_run_when_action_overruns() {
        let db = TestDb::new();
        let ctx = claimed(&db, "slow", 5).await;
        let action = Slow {
            started: AtomicUsize::new(0),
        };

        execute(ctx, &action, RetryPolicy::default()).await.unwrap();
        assert_eq!(action.started.load(Ordering::SeqCst), 1);

        let row = db.store().get_job(&"slow".into()).unwrap().unwrap();
        assert_eq!(row.last_run_status, Some(RunStatus::Failure));
        assert_eq!(row.last_run_error.as_deref(), Some("action timed out after 5s"));
        assert_eq!(row.consecutive_failures, 1);
        assert!(row.last_run_duration_ms.unwrap() >= 5_000);
    }
}
