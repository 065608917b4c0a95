//! Step queue port.
//!
//! The orchestrator enqueues one job per step run; a worker claims each job
//! and drives it through the processor. The contract the engine relies on:
//!
//! - the job name is the step type, so workers can route by executor;
//! - `options.job_id` is the step-run id, and the queue de-duplicates on
//!   it, so re-enqueueing an already-queued step run is a no-op;
//! - a job with `options.depends_on` entries becomes runnable only once all
//!   of those jobs completed successfully;
//! - failed handler invocations are retried per `options.attempts` and
//!   `options.backoff` before the job is parked as failed.

use runloom_types::error::QueueError;
use runloom_types::job::{EnqueueOptions, StepRunJob};

pub trait StepQueue: Send + Sync {
    /// Enqueue one step-run job, returning the queue's job id (the
    /// de-duplicated id when the job already existed).
    fn enqueue(
        &self,
        step_type: &'static str,
        payload: StepRunJob,
        options: EnqueueOptions,
    ) -> impl Future<Output = Result<String, QueueError>> + Send;
}
