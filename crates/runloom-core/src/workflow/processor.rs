//! Worker-side step execution: the state machine behind one queue delivery.
//!
//! One `process` call drives one step-run attempt end to end:
//!
//! 1. promote the run `QUEUED -> RUNNING` (guarded; only the first step of
//!    a run actually flips it);
//! 2. mark the step run `RUNNING` with this delivery's attempt number --
//!    unguarded, because retries re-enter from `FAILED`;
//! 3. resolve the step: cached version lookup, rate-limit check, override
//!    merge, dependency outputs, secret decryption, template resolution;
//! 4. dispatch to the registered executor;
//! 5. persist the outcome redacted and byte-bounded, then finalize the run
//!    once every sibling is terminal.
//!
//! Failures follow the same tail: the error is redacted, wrapped, and
//! stored on the step run before the error is re-raised so the queue can
//! retry. The run itself is only failed once the final attempt is spent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use runloom_types::config::WorkerConfig;
use runloom_types::envelope;
use runloom_types::error::{SecretError, StoreError};
use runloom_types::job::{RequestOverride, StepRunJob};
use runloom_types::run::{RunStatus, StepRun};
use runloom_types::workflow::OutputPolicy;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::cache::WorkerCache;
use super::dag;
use super::executor::{ExecutorError, ExecutorInput, ExecutorRegistry};
use super::persist::{self, PersistError, PersistPolicy};
use super::rate_limit::RateLimiter;
use super::redact;
use super::template::{self, ResolutionContext, TemplateError};
use crate::repository::secret::{SecretCipher, SecretStore};
use crate::repository::workflow::WorkflowStore;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("workflow version '{0}' not found")]
    VersionNotFound(Uuid),

    #[error("step '{0}' not found in workflow version")]
    StepNotFound(String),

    #[error("rate limit '{key}' exceeded ({current}/{max}); window resets in {retry_after_secs}s")]
    RateLimited {
        key: String,
        current: u32,
        max: u32,
        retry_after_secs: u64,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct ResolvedStep {
    output: Value,
    /// The merged step context input, persisted as the input snapshot.
    input: Map<String, Value>,
    /// Decrypted secret values that must never survive into persisted JSON.
    secret_values: Vec<String>,
    output_policy: OutputPolicy,
}

/// Executes step-run jobs delivered by the queue.
pub struct StepRunProcessor<S, SS, C> {
    store: Arc<S>,
    secrets: Arc<SS>,
    cipher: Arc<C>,
    registry: Arc<ExecutorRegistry>,
    cache: Arc<WorkerCache>,
    limiter: RateLimiter,
    output_max_bytes: usize,
    error_max_bytes: usize,
    max_attempts: u32,
}

impl<S, SS, C> StepRunProcessor<S, SS, C>
where
    S: WorkflowStore,
    SS: SecretStore,
    C: SecretCipher,
{
    pub fn new(
        store: Arc<S>,
        secrets: Arc<SS>,
        cipher: Arc<C>,
        registry: Arc<ExecutorRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        StepRunProcessor {
            store,
            secrets,
            cipher,
            registry,
            cache: Arc::new(WorkerCache::new(&config.cache)),
            limiter: RateLimiter::new(),
            output_max_bytes: config.output.max_bytes,
            error_max_bytes: config.output.error_max_bytes,
            max_attempts: config.queue.attempts,
        }
    }

    /// Process one queue delivery. `attempt` is 1-based.
    ///
    /// Errors are returned *after* being persisted on the step run, so the
    /// queue's retry machinery sees them while the store already reflects
    /// the failure.
    pub async fn process(&self, job: &StepRunJob, attempt: u32) -> Result<(), ProcessorError> {
        let span = tracing::info_span!(
            "run.execute_step",
            run.operation.name = "execute_step",
            run.id = %job.workflow_run_id,
            run.step.run_id = %job.step_run_id,
            run.step.key = job.step_key.as_str(),
            run.step.attempt = attempt,
        );
        self.process_attempt(job, attempt).instrument(span).await
    }

    async fn process_attempt(&self, job: &StepRunJob, attempt: u32) -> Result<(), ProcessorError> {
        let started_at = Utc::now();
        tracing::info!("processing step run");

        self.store
            .mark_run_running_if_queued(job.workflow_run_id, started_at)
            .await?;
        self.store
            .start_step_run(job.step_run_id, attempt, started_at)
            .await?;

        match self.resolve_and_execute(job).await {
            Ok(resolved) => {
                let finished_at = Utc::now();
                let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

                let output = redact::redact_secrets(&resolved.output, &resolved.secret_values);
                let max_bytes = resolved.output_policy.max_bytes.unwrap_or(self.output_max_bytes);
                let truncate = resolved.output_policy.truncate.unwrap_or(true);
                let output_env = persist::wrap_for_db(
                    &output,
                    &PersistPolicy::new(max_bytes, truncate, "step_output"),
                );

                let output_env = match output_env {
                    Ok(env) => env,
                    Err(err) => {
                        // Over the hard ceiling: the step fails instead of
                        // persisting an unbounded payload.
                        let err = ProcessorError::from(err);
                        self.record_failure(job, &err, attempt).await;
                        return Err(err);
                    }
                };

                let input = redact::redact_secrets(
                    &Value::Object(resolved.input),
                    &resolved.secret_values,
                );
                let input_env = persist::wrap_for_db(
                    &input,
                    &PersistPolicy::new(self.output_max_bytes, true, "step_input"),
                )?;

                self.store
                    .complete_step_run(job.step_run_id, output_env, input_env, duration_ms, finished_at)
                    .await?;
                tracing::info!(
                    step_run_id = %job.step_run_id,
                    step_key = job.step_key.as_str(),
                    duration_ms,
                    "step run succeeded"
                );

                self.finalize_run(job.workflow_run_id).await?;
                Ok(())
            }
            Err(err) => {
                self.record_failure(job, &err, attempt).await;
                Err(err)
            }
        }
    }

    /// Steps 3 and 4: build the execution context and dispatch.
    async fn resolve_and_execute(&self, job: &StepRunJob) -> Result<ResolvedStep, ProcessorError> {
        let version = self
            .cache
            .workflow_version(job.workflow_version_id, || {
                self.store.workflow_version(job.workflow_version_id)
            })
            .await?
            .ok_or(ProcessorError::VersionNotFound(job.workflow_version_id))?;

        let step = version
            .definition
            .find_step(&job.step_key)
            .ok_or_else(|| ProcessorError::StepNotFound(job.step_key.clone()))?;

        if let Some(limit) = &step.rate_limit {
            let decision = self.limiter.check(limit);
            if !decision.allowed {
                return Err(ProcessorError::RateLimited {
                    key: limit.key.clone(),
                    current: decision.current,
                    max: limit.max,
                    retry_after_secs: decision.retry_after.as_secs(),
                });
            }
        }

        // Override merge happens before resolution, so templates inside a
        // body override are honored.
        let mut request = step.request.payload_json();
        if step.step_type() == "http" {
            if let Some(request_override) = &job.request_override {
                apply_http_override(&mut request, request_override);
            }
        }

        // Run input under step-level input; the step's own defaults win.
        let mut input = match &job.input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in step.step_input() {
            input.insert(key, value);
        }

        // Dependency outputs, persistence envelope stripped. A dependency
        // without a succeeded output stays absent and template resolution
        // surfaces it as StepUnavailable.
        let mut steps = Map::new();
        for dep in &job.depends_on {
            if let Some(output) = self
                .store
                .latest_succeeded_output(job.workflow_run_id, dep)
                .await?
            {
                steps.insert(dep.clone(), envelope::unwrap_data(&output).clone());
            }
        }

        let secret_map = self.load_secrets(&request).await?;
        let secret_values: Vec<String> = secret_map.values().cloned().collect();

        let ctx = ResolutionContext {
            input: input.clone(),
            steps: steps.clone(),
            secret: secret_map,
        };
        let resolution = template::resolve(&request, &ctx)?;

        let executor = self.registry.get(step.step_type())?;
        let exec_input = ExecutorInput {
            request: resolution.resolved,
            input: input.clone(),
            steps,
        };
        let output = executor.execute(&exec_input).await?;

        Ok(ResolvedStep {
            output: output.to_value(),
            input,
            secret_values,
            output_policy: step.output_policy.clone().unwrap_or_default(),
        })
    }

    /// Decrypt every secret the request references, through the cache.
    async fn load_secrets(
        &self,
        request: &Value,
    ) -> Result<BTreeMap<String, String>, ProcessorError> {
        let serialized = request.to_string();
        let mut names = dag::scan_references(&serialized, "secret.", false);
        names.sort();
        names.dedup();

        let mut secrets = BTreeMap::new();
        for name in names {
            if let Some(plaintext) = self.cache.secret(&name) {
                secrets.insert(name, plaintext);
                continue;
            }
            let Some(record) = self.secrets.find_by_name(&name).await? else {
                // Absent from the context; resolution reports SecretMissing.
                continue;
            };
            let plaintext = self.cipher.decrypt(record.value.expose())?;
            self.cache.put_secret(&name, plaintext.clone());
            secrets.insert(name, plaintext);
        }
        Ok(secrets)
    }

    /// The failure tail: persist redacted, bounded error detail, then
    /// finalize the run when no retry is coming.
    async fn record_failure(&self, job: &StepRunJob, err: &ProcessorError, attempt: u32) {
        let finished_at = Utc::now();
        tracing::error!(
            run_id = %job.workflow_run_id,
            step_run_id = %job.step_run_id,
            step_key = job.step_key.as_str(),
            attempt,
            error = %err,
            "step run failed"
        );

        let detail = redact::redact_secrets(&json!({ "message": err.to_string() }), &[]);
        let error_env = persist::wrap_for_db(
            &detail,
            &PersistPolicy::new(self.error_max_bytes, true, "step_error"),
        )
        .unwrap_or(detail);

        if let Err(store_err) = self
            .store
            .fail_step_run(job.step_run_id, error_env, finished_at)
            .await
        {
            tracing::error!(step_run_id = %job.step_run_id, error = %store_err, "could not persist step failure");
        }

        if attempt >= self.max_attempts {
            if let Err(store_err) = self.finalize_run(job.workflow_run_id).await {
                tracing::error!(run_id = %job.workflow_run_id, error = %store_err, "could not finalize run after failure");
            }
        }
    }

    /// Once every sibling is terminal, move the run to its terminal status.
    /// Idempotent: concurrent finishers race benignly on the guarded write.
    async fn finalize_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        // Every step of a run finalizes; the cached run row absorbs the
        // repeat reads, and an already-terminal run skips the sibling scan.
        let run = self
            .cache
            .workflow_run(run_id, || self.store.run(run_id))
            .await?;
        if run.is_some_and(|r| r.status.is_terminal()) {
            return Ok(());
        }

        let step_runs = self.store.step_runs(run_id).await?;
        if step_runs.is_empty() || !step_runs.iter().all(StepRun::is_terminal) {
            return Ok(());
        }

        let status = if step_runs.iter().any(|s| s.status == RunStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.store
            .finish_run_if_active(run_id, status, Utc::now())
            .await?;
        self.cache.invalidate_run(run_id);
        tracing::info!(run_id = %run_id, status = %status, "workflow run finalized");
        Ok(())
    }
}

/// Merge a request override into an http request spec: query keys merge
/// entry-wise (override wins), a body override replaces the body whole.
fn apply_http_override(request: &mut Value, request_override: &RequestOverride) {
    let Value::Object(map) = request else {
        return;
    };

    if let Some(query_override) = &request_override.query {
        let query = map
            .entry("query".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(query) = query {
            for (key, value) in query_override {
                query.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(body) = &request_override.body {
        map.insert("body".to_string(), body.clone());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
