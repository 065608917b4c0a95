//! In-process step queue.
//!
//! Honors the `StepQueue` contract: job-id de-duplication, dependency
//! gating on successful completion, and per-job retry policy. Backoff
//! delays are computed and recorded but not slept, so embedded engines and
//! tests drain instantly; a broker-backed queue would schedule real delays.
//!
//! `drain` is the worker loop: it repeatedly picks a runnable job (every
//! dependency completed), hands its payload to the handler, and retries per
//! the job's options before parking it as failed. Jobs behind a failed
//! dependency are never handed out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use runloom_core::queue::StepQueue;
use runloom_types::error::QueueError;
use runloom_types::job::{BackoffKind, EnqueueOptions, StepRunJob};
use uuid::Uuid;

/// Queue-side lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Completed,
    Failed,
}

/// One queued job and its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    /// Job name; the step type.
    pub name: String,
    pub payload: StepRunJob,
    pub options: EnqueueOptions,
    pub status: JobStatus,
    /// Handler invocations consumed.
    pub attempts_made: u32,
    /// Computed backoff delay (ms) before each retry, in order.
    pub backoff_history: Vec<u64>,
}

impl JobRecord {
    fn is_runnable(&self, jobs: &BTreeMap<String, JobRecord>) -> bool {
        self.status == JobStatus::Waiting
            && self
                .options
                .depends_on
                .iter()
                .all(|dep| matches!(jobs.get(dep), Some(j) if j.status == JobStatus::Completed))
    }
}

/// Summary of one `drain` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    pub failed: usize,
    /// Jobs left waiting behind a failed dependency.
    pub gated: usize,
}

/// Shared in-process queue. Cloning yields another handle onto the same
/// jobs.
#[derive(Default, Clone)]
pub struct MemoryStepQueue {
    /// Insertion order preserved separately; BTreeMap keys are job ids.
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, JobRecord>,
    order: Vec<String>,
}

impl MemoryStepQueue {
    pub fn new() -> Self {
        MemoryStepQueue::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Closed)
    }

    /// Snapshot of one job, by queue job id.
    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.lock().ok()?.jobs.get(job_id).cloned()
    }

    /// Snapshot of every job, in enqueue order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        match self.inner.lock() {
            Ok(inner) => inner
                .order
                .iter()
                .filter_map(|id| inner.jobs.get(id).cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Run every runnable job to completion or exhaustion.
    ///
    /// The handler receives the payload and a 1-based attempt number.
    /// Returns once no waiting job can make progress; jobs gated behind a
    /// failed dependency are counted but left waiting.
    pub async fn drain<F, Fut, E>(&self, handler: F) -> Result<DrainSummary, QueueError>
    where
        F: Fn(StepRunJob, u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut summary = DrainSummary::default();

        loop {
            // Pick outside the handler await so the lock never crosses it.
            let next = {
                let inner = self.lock()?;
                inner
                    .order
                    .iter()
                    .filter_map(|id| inner.jobs.get(id))
                    .find(|j| j.is_runnable(&inner.jobs))
                    .map(|j| (j.id.clone(), j.payload.clone(), j.options.clone()))
            };
            let Some((job_id, payload, options)) = next else {
                break;
            };

            let mut failed_err = None;
            for attempt in 1..=options.attempts.max(1) {
                {
                    let mut inner = self.lock()?;
                    if let Some(job) = inner.jobs.get_mut(&job_id) {
                        job.attempts_made = attempt;
                        if attempt > 1 {
                            job.backoff_history
                                .push(backoff_delay_ms(&options, attempt));
                        }
                    }
                }
                match handler(payload.clone(), attempt).await {
                    Ok(()) => {
                        failed_err = None;
                        break;
                    }
                    Err(err) => failed_err = Some(err.to_string()),
                }
            }

            let mut inner = self.lock()?;
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                continue;
            };
            match failed_err {
                None => {
                    job.status = JobStatus::Completed;
                    summary.completed += 1;
                }
                Some(message) => {
                    job.status = JobStatus::Failed;
                    summary.failed += 1;
                    tracing::warn!(job_id = job.id.as_str(), error = %message, "job exhausted its attempts");
                }
            }
        }

        let inner = self.lock()?;
        summary.gated = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Waiting)
            .count();
        Ok(summary)
    }
}

/// Delay before the given (2-based) retry attempt, per the job's backoff.
fn backoff_delay_ms(options: &EnqueueOptions, attempt: u32) -> u64 {
    match options.backoff.kind {
        BackoffKind::Fixed => options.backoff.delay_ms,
        BackoffKind::Exponential => options
            .backoff
            .delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(2)).min(32)),
    }
}

impl StepQueue for MemoryStepQueue {
    async fn enqueue(
        &self,
        step_type: &'static str,
        payload: StepRunJob,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let job_id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let mut inner = self.lock()?;
        // De-duplicate on job id; re-enqueueing a known job is a no-op.
        if inner.jobs.contains_key(&job_id) {
            return Ok(job_id);
        }

        inner.order.push(job_id.clone());
        inner.jobs.insert(
            job_id.clone(),
            JobRecord {
                id: job_id.clone(),
                name: step_type.to_string(),
                payload,
                options,
                status: JobStatus::Waiting,
                attempts_made: 0,
                backoff_history: Vec::new(),
            },
        );
        Ok(job_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(step_key: &str) -> StepRunJob {
        StepRunJob {
            workflow_run_id: Uuid::now_v7(),
            step_run_id: Uuid::now_v7(),
            step_key: step_key.to_string(),
            workflow_version_id: Uuid::now_v7(),
            input: serde_json::json!({}),
            depends_on: Vec::new(),
            request_override: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_on_job_id() {
        let queue = MemoryStepQueue::new();
        let id = Uuid::now_v7();

        let first = queue
            .enqueue("http", job("fetch"), EnqueueOptions::for_step_run(id, vec![]))
            .await
            .unwrap();
        let second = queue
            .enqueue("http", job("fetch"), EnqueueOptions::for_step_run(id, vec![]))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_runs_dependents_after_parents() {
        let queue = MemoryStepQueue::new();
        let parent_id = Uuid::now_v7();
        let child_id = Uuid::now_v7();
        queue
            .enqueue("http", job("fetch"), EnqueueOptions::for_step_run(parent_id, vec![]))
            .await
            .unwrap();
        queue
            .enqueue(
                "transform",
                job("shape"),
                EnqueueOptions::for_step_run(child_id, vec![parent_id.to_string()]),
            )
            .await
            .unwrap();

        let seen = Mutex::new(Vec::new());
        let summary = queue
            .drain(|payload, _attempt| {
                seen.lock().unwrap().push(payload.step_key.clone());
                async { Ok::<_, QueueError>(()) }
            })
            .await
            .unwrap();

        assert_eq!(summary, DrainSummary { completed: 2, failed: 0, gated: 0 });
        assert_eq!(*seen.lock().unwrap(), vec!["fetch", "shape"]);
    }

    #[tokio::test]
    async fn test_failed_job_retries_then_gates_dependents() {
        let queue = MemoryStepQueue::new();
        let parent_id = Uuid::now_v7();
        let child_id = Uuid::now_v7();
        queue
            .enqueue("condition", job("gate"), EnqueueOptions::for_step_run(parent_id, vec![]))
            .await
            .unwrap();
        queue
            .enqueue(
                "http",
                job("notify"),
                EnqueueOptions::for_step_run(child_id, vec![parent_id.to_string()]),
            )
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        let summary = queue
            .drain(|payload, _attempt| {
                if payload.step_key == "gate" {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("condition failed") }
                } else {
                    panic!("gated job must not run");
                }
            })
            .await
            .unwrap();

        assert_eq!(summary, DrainSummary { completed: 0, failed: 1, gated: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let parent = queue.job(&parent_id.to_string()).unwrap();
        assert_eq!(parent.status, JobStatus::Failed);
        assert_eq!(parent.attempts_made, 3);
        // Exponential backoff from the default 5s base.
        assert_eq!(parent.backoff_history, vec![5000, 10000]);

        let child = queue.job(&child_id.to_string()).unwrap();
        assert_eq!(child.status, JobStatus::Waiting);
        assert_eq!(child.attempts_made, 0);
    }

    #[tokio::test]
    async fn test_handler_attempt_numbers_are_one_based() {
        let queue = MemoryStepQueue::new();
        queue
            .enqueue("http", job("flaky"), EnqueueOptions::for_step_run(Uuid::now_v7(), vec![]))
            .await
            .unwrap();

        let attempts = Mutex::new(Vec::new());
        queue
            .drain(|_, attempt| {
                attempts.lock().unwrap().push(attempt);
                async move {
                    if attempt < 2 {
                        Err("transient")
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    }
}
