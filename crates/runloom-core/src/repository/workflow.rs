//! Workflow store port: workflows, versions, triggers, events, runs, and
//! step runs.
//!
//! Run creation must be all-or-nothing, so the port splits in two:
//! [`RunTransaction`] batches writes and makes them visible atomically on
//! `commit` (a dropped transaction leaves no trace), while the direct
//! methods on [`WorkflowStore`] cover reads and the single-row status
//! transitions the processor performs. The `*_if_*` methods are guarded:
//! they apply only when the row is still in the expected state, which is
//! what makes duplicate queue deliveries and post-failure reconciliation
//! safe to run blindly.

use chrono::{DateTime, Utc};
use runloom_types::error::StoreError;
use runloom_types::run::{RunStatus, StepRun, WorkflowRun};
use runloom_types::workflow::{Event, Trigger, TriggerType, Workflow, WorkflowVersion};
use serde_json::Value;
use uuid::Uuid;

/// A write batch applied atomically on commit.
///
/// Reads through a transaction observe both committed state and the
/// transaction's own staged writes.
pub trait RunTransaction: Send {
    fn insert_workflow(
        &mut self,
        workflow: Workflow,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_version(
        &mut self,
        version: WorkflowVersion,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Advance a workflow's `latest_version_id`.
    fn set_latest_version(
        &mut self,
        workflow_id: Uuid,
        version_id: Uuid,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Highest version number recorded for a workflow, if any.
    fn latest_version_number(
        &mut self,
        workflow_id: Uuid,
    ) -> impl Future<Output = Result<Option<u32>, StoreError>> + Send;

    fn workflow_version(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowVersion>, StoreError>> + Send;

    /// First trigger of the given type on a workflow.
    fn find_trigger(
        &mut self,
        workflow_id: Uuid,
        trigger_type: TriggerType,
    ) -> impl Future<Output = Result<Option<Trigger>, StoreError>> + Send;

    fn insert_trigger(
        &mut self,
        trigger: Trigger,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_event(
        &mut self,
        event: Event,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_run(
        &mut self,
        run: WorkflowRun,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_step_run(
        &mut self,
        step_run: StepRun,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Move a run (possibly one staged in this transaction) to a terminal
    /// status.
    fn finish_run(
        &mut self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Storage port for the orchestration engine.
pub trait WorkflowStore: Send + Sync {
    type Tx: RunTransaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    // -- reads ------------------------------------------------------------

    fn workflow(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Workflow>, StoreError>> + Send;

    fn workflow_version(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowVersion>, StoreError>> + Send;

    fn run(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowRun>, StoreError>> + Send;

    /// Runs of a workflow, most recent first.
    fn list_runs(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, StoreError>> + Send;

    fn step_run(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<StepRun>, StoreError>> + Send;

    /// Step runs of a run, in creation order.
    fn step_runs(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Vec<StepRun>, StoreError>> + Send;

    /// The persisted output of the most recent `SUCCEEDED` step run for
    /// `step_key` within a run.
    fn latest_succeeded_output(
        &self,
        run_id: Uuid,
        step_key: &str,
    ) -> impl Future<Output = Result<Option<Value>, StoreError>> + Send;

    // -- run transitions ---------------------------------------------------

    /// `QUEUED -> RUNNING`; a no-op when the run already left `QUEUED`.
    fn mark_run_running_if_queued(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Move a run to a terminal status; a no-op when it is already terminal.
    fn finish_run_if_active(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    // -- step-run transitions ----------------------------------------------

    /// Mark a step run `RUNNING` and record the delivery attempt.
    /// Deliberately unguarded: retries re-enter `RUNNING` from `FAILED`.
    fn start_step_run(
        &self,
        id: Uuid,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn complete_step_run(
        &self,
        id: Uuid,
        output: Value,
        input: Value,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn fail_step_run(
        &self,
        id: Uuid,
        error: Value,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fail every listed step run still in `QUEUED`, returning how many
    /// rows changed. Used after a partial enqueue failure; steps that made
    /// it onto the queue are left for their workers.
    fn fail_step_runs_if_queued(
        &self,
        ids: &[Uuid],
        error: Value,
        finished_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}
