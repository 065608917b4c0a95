//! In-memory store fakes for engine tests.
//!
//! `TestStore` implements [`WorkflowStore`] with staged transactions over a
//! mutex-guarded state, `TestSecretStore` serves fixed secret rows, and
//! `PassthroughCipher` decrypts by stripping a `enc:` prefix. These exist so
//! orchestrator, processor, and service tests can run without runloom-infra.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use runloom_types::error::{SecretError, StoreError};
use runloom_types::run::{RunStatus, StepRun, WorkflowRun};
use runloom_types::secret::{Redacted, SecretRecord};
use runloom_types::workflow::{Event, Trigger, TriggerType, Workflow, WorkflowVersion};
use serde_json::Value;
use uuid::Uuid;

use super::secret::{SecretCipher, SecretStore};
use super::workflow::{RunTransaction, WorkflowStore};

#[derive(Default)]
pub(crate) struct State {
    pub workflows: BTreeMap<Uuid, Workflow>,
    pub versions: BTreeMap<Uuid, WorkflowVersion>,
    pub triggers: Vec<Trigger>,
    pub events: Vec<Event>,
    pub runs: BTreeMap<Uuid, WorkflowRun>,
    pub step_runs: BTreeMap<Uuid, StepRun>,
    /// Step-run ids per run, in insertion order.
    pub step_order: BTreeMap<Uuid, Vec<Uuid>>,
}

#[derive(Default, Clone)]
pub(crate) struct TestStore {
    state: Arc<Mutex<State>>,
}

impl TestStore {
    pub fn new() -> Self {
        TestStore::default()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn seed_version(&self, version: WorkflowVersion) {
        self.state().versions.insert(version.id, version);
    }

    pub fn seed_run(&self, run: WorkflowRun) {
        self.state().runs.insert(run.id, run);
    }

    pub fn seed_step_run(&self, step_run: StepRun) {
        let mut state = self.state();
        state
            .step_order
            .entry(step_run.run_id)
            .or_default()
            .push(step_run.id);
        state.step_runs.insert(step_run.id, step_run);
    }
}

pub(crate) struct TestTx {
    store: TestStore,
    staged: State,
    /// `finish_run` targets not staged in this transaction.
    deferred_finishes: Vec<(Uuid, RunStatus, DateTime<Utc>)>,
}

impl RunTransaction for TestTx {
    async fn insert_workflow(&mut self, workflow: Workflow) -> Result<(), StoreError> {
        self.staged.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn insert_version(&mut self, version: WorkflowVersion) -> Result<(), StoreError> {
        self.staged.versions.insert(version.id, version);
        Ok(())
    }

    async fn set_latest_version(
        &mut self,
        workflow_id: Uuid,
        version_id: Uuid,
    ) -> Result<(), StoreError> {
        if let Some(workflow) = self.staged.workflows.get_mut(&workflow_id) {
            workflow.latest_version_id = Some(version_id);
            return Ok(());
        }
        let mut committed = self.store.state();
        let workflow = committed
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;
        workflow.latest_version_id = Some(version_id);
        Ok(())
    }

    async fn latest_version_number(&mut self, workflow_id: Uuid) -> Result<Option<u32>, StoreError> {
        let committed = self.store.state();
        let highest = committed
            .versions
            .values()
            .chain(self.staged.versions.values())
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version)
            .max();
        Ok(highest)
    }

    async fn workflow_version(&mut self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        if let Some(version) = self.staged.versions.get(&id) {
            return Ok(Some(version.clone()));
        }
        Ok(self.store.state().versions.get(&id).cloned())
    }

    async fn find_trigger(
        &mut self,
        workflow_id: Uuid,
        trigger_type: TriggerType,
    ) -> Result<Option<Trigger>, StoreError> {
        let committed = self.store.state();
        let found = committed
            .triggers
            .iter()
            .chain(self.staged.triggers.iter())
            .find(|t| t.workflow_id == workflow_id && t.trigger_type == trigger_type)
            .cloned();
        Ok(found)
    }

    async fn insert_trigger(&mut self, trigger: Trigger) -> Result<(), StoreError> {
        self.staged.triggers.push(trigger);
        Ok(())
    }

    async fn insert_event(&mut self, event: Event) -> Result<(), StoreError> {
        self.staged.events.push(event);
        Ok(())
    }

    async fn insert_run(&mut self, run: WorkflowRun) -> Result<(), StoreError> {
        self.staged.runs.insert(run.id, run);
        Ok(())
    }

    async fn insert_step_run(&mut self, step_run: StepRun) -> Result<(), StoreError> {
        self.staged
            .step_order
            .entry(step_run.run_id)
            .or_default()
            .push(step_run.id);
        self.staged.step_runs.insert(step_run.id, step_run);
        Ok(())
    }

    async fn finish_run(
        &mut self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(run) = self.staged.runs.get_mut(&run_id) {
            run.status = status;
            run.finished_at = Some(finished_at);
            run.updated_at = finished_at;
        } else {
            self.deferred_finishes.push((run_id, status, finished_at));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut state = self.store.state();
        state.workflows.extend(self.staged.workflows);
        state.versions.extend(self.staged.versions);
        state.triggers.extend(self.staged.triggers);
        state.events.extend(self.staged.events);
        state.runs.extend(self.staged.runs);
        state.step_runs.extend(self.staged.step_runs);
        for (run_id, ids) in self.staged.step_order {
            state.step_order.entry(run_id).or_default().extend(ids);
        }
        for (run_id, status, finished_at) in self.deferred_finishes {
            if let Some(run) = state.runs.get_mut(&run_id) {
                run.status = status;
                run.finished_at = Some(finished_at);
                run.updated_at = finished_at;
            }
        }
        Ok(())
    }
}

impl WorkflowStore for TestStore {
    type Tx = TestTx;

    async fn begin(&self) -> Result<TestTx, StoreError> {
        Ok(TestTx {
            store: self.clone(),
            staged: State::default(),
            deferred_finishes: Vec::new(),
        })
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.state().workflows.get(&id).cloned())
    }

    async fn workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self.state().versions.get(&id).cloned())
    }

    async fn run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.state().runs.get(&id).cloned())
    }

    async fn list_runs(&self, workflow_id: Uuid, limit: usize) -> Result<Vec<WorkflowRun>, StoreError> {
        let state = self.state();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn step_run(&self, id: Uuid) -> Result<Option<StepRun>, StoreError> {
        Ok(self.state().step_runs.get(&id).cloned())
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let state = self.state();
        let ids = state.step_order.get(&run_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.step_runs.get(id).cloned())
            .collect())
    }

    async fn latest_succeeded_output(
        &self,
        run_id: Uuid,
        step_key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let state = self.state();
        let ids = state.step_order.get(&run_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .rev()
            .filter_map(|id| state.step_runs.get(id))
            .find(|s| s.step_key == step_key && s.status == RunStatus::Succeeded)
            .and_then(|s| s.output.clone()))
    }

    async fn mark_run_running_if_queued(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(run) = state.runs.get_mut(&run_id) {
            if run.status == RunStatus::Queued {
                run.status = RunStatus::Running;
                run.started_at = Some(started_at);
                run.updated_at = started_at;
            }
        }
        Ok(())
    }

    async fn finish_run_if_active(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(run) = state.runs.get_mut(&run_id) {
            if !run.status.is_terminal() {
                run.status = status;
                run.finished_at = Some(finished_at);
                run.updated_at = finished_at;
            }
        }
        Ok(())
    }

    async fn start_step_run(
        &self,
        id: Uuid,
        attempt: u32,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let step = state.step_runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.status = RunStatus::Running;
        step.attempt = attempt;
        step.started_at = Some(started_at);
        step.updated_at = started_at;
        Ok(())
    }

    async fn complete_step_run(
        &self,
        id: Uuid,
        output: Value,
        input: Value,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let step = state.step_runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.status = RunStatus::Succeeded;
        step.output = Some(output);
        step.input = Some(input);
        step.error = None;
        step.duration_ms = Some(duration_ms);
        step.finished_at = Some(finished_at);
        step.updated_at = finished_at;
        Ok(())
    }

    async fn fail_step_run(
        &self,
        id: Uuid,
        error: Value,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let step = state.step_runs.get_mut(&id).ok_or(StoreError::NotFound)?;
        step.status = RunStatus::Failed;
        step.error = Some(error);
        step.finished_at = Some(finished_at);
        step.updated_at = finished_at;
        Ok(())
    }

    async fn fail_step_runs_if_queued(
        &self,
        ids: &[Uuid],
        error: Value,
        finished_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state();
        let mut changed = 0;
        for id in ids {
            if let Some(step) = state.step_runs.get_mut(id) {
                if step.status == RunStatus::Queued {
                    step.status = RunStatus::Failed;
                    step.error = Some(error.clone());
                    step.finished_at = Some(finished_at);
                    step.updated_at = finished_at;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Secret fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct TestSecretStore {
    records: Mutex<BTreeMap<String, SecretRecord>>,
}

impl TestSecretStore {
    pub fn new() -> Self {
        TestSecretStore::default()
    }

    pub fn seed(&self, name: &str, at_rest_value: &str) {
        let now = Utc::now();
        self.records.lock().unwrap().insert(
            name.to_string(),
            SecretRecord {
                id: Uuid::now_v7(),
                name: name.to_string(),
                value: Redacted::new(at_rest_value),
                created_at: now,
                updated_at: now,
            },
        );
    }
}

impl SecretStore for TestSecretStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.records.lock().unwrap().get(name).cloned())
    }

    async fn find_many_by_names(&self, names: &[String]) -> Result<Vec<SecretRecord>, StoreError> {
        let records = self.records.lock().unwrap();
        Ok(names.iter().filter_map(|n| records.get(n).cloned()).collect())
    }
}

/// Decrypts by stripping a literal `enc:` prefix; everything else passes
/// through, matching the real cipher's plaintext-passthrough contract.
pub(crate) struct PassthroughCipher;

impl SecretCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        Ok(format!("enc:{plaintext}"))
    }

    fn decrypt(&self, value: &str) -> Result<String, SecretError> {
        Ok(value.strip_prefix("enc:").unwrap_or(value).to_string())
    }
}
