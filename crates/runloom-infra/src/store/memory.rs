//! In-memory implementations of the workflow and secret store ports.
//!
//! State lives in a mutex-guarded map shared by cloned handles, so an
//! orchestrator, a worker pool, and a service can all point at the same
//! store. Transactions stage their writes privately and merge them into the
//! shared state on commit; a dropped transaction leaves no trace, which is
//! the atomicity the [`RunTransaction`] port requires.
//!
//! Suitable for embedded use and tests. A database-backed store implements
//! the same two traits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use runloom_core::repository::secret::SecretStore;
use runloom_core::repository::workflow::{RunTransaction, WorkflowStore};
use runloom_types::error::StoreError;
use runloom_types::run::{RunStatus, StepRun, WorkflowRun};
use runloom_types::secret::{Redacted, SecretRecord};
use runloom_types::workflow::{Event, Trigger, TriggerType, Workflow, WorkflowVersion};
use serde_json::Value;
use uuid::Uuid;

#[derive(Default)]
struct State {
    workflows: BTreeMap<Uuid, Workflow>,
    versions: BTreeMap<Uuid, WorkflowVersion>,
    triggers: Vec<Trigger>,
    events: Vec<Event>,
    runs: BTreeMap<Uuid, WorkflowRun>,
    step_runs: BTreeMap<Uuid, StepRun>,
    /// Step-run ids per run, in insertion order.
    step_order: BTreeMap<Uuid, Vec<Uuid>>,
}

/// Shared in-memory workflow store. Cloning yields another handle onto the
/// same state.
#[derive(Default, Clone)]
pub struct MemoryWorkflowStore {
    state: Arc<Mutex<State>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        MemoryWorkflowStore::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Connection)
    }

    /// Stored events for a trigger, in arrival order.
    pub fn events_for_trigger(&self, trigger_id: Uuid) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| e.trigger_id == trigger_id)
            .cloned()
            .collect())
    }

    /// Triggers attached to a workflow.
    pub fn triggers_for_workflow(&self, workflow_id: Uuid) -> Result<Vec<Trigger>, StoreError> {
        Ok(self
            .lock()?
            .triggers
            .iter()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

/// A staged write batch over a [`MemoryWorkflowStore`].
pub struct MemoryTransaction {
    store: MemoryWorkflowStore,
    staged: State,
    /// `finish_run` calls targeting rows not staged in this transaction;
    /// applied to committed state at commit time.
    deferred_finishes: Vec<(Uuid, RunStatus, DateTime<Utc>)>,
}

impl RunTransaction for MemoryTransaction {
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
        let mut committed = self.store.lock()?;
        let workflow = committed
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound)?;
        workflow.latest_version_id = Some(version_id);
        Ok(())
    }

    async fn latest_version_number(&mut self, workflow_id: Uuid) -> Result<Option<u32>, StoreError> {
        let committed = self.store.lock()?;
        Ok(committed
            .versions
            .values()
            .chain(self.staged.versions.values())
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version)
            .max())
    }

    async fn workflow_version(&mut self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        if let Some(version) = self.staged.versions.get(&id) {
            return Ok(Some(version.clone()));
        }
        Ok(self.store.lock()?.versions.get(&id).cloned())
    }

    async fn find_trigger(
        &mut self,
        workflow_id: Uuid,
        trigger_type: TriggerType,
    ) -> Result<Option<Trigger>, StoreError> {
        let committed = self.store.lock()?;
        Ok(committed
            .triggers
            .iter()
            .chain(self.staged.triggers.iter())
            .find(|t| t.workflow_id == workflow_id && t.trigger_type == trigger_type)
            .cloned())
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
        let mut state = self.store.lock()?;
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

impl WorkflowStore for MemoryWorkflowStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            store: self.clone(),
            staged: State::default(),
            deferred_finishes: Vec::new(),
        })
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.lock()?.workflows.get(&id).cloned())
    }

    async fn workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self.lock()?.versions.get(&id).cloned())
    }

    async fn run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.lock()?.runs.get(&id).cloned())
    }

    async fn list_runs(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let state = self.lock()?;
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
        Ok(self.lock()?.step_runs.get(&id).cloned())
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let state = self.lock()?;
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
        let state = self.lock()?;
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
        let mut state = self.lock()?;
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
        let mut state = self.lock()?;
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
        let mut state = self.lock()?;
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
        let mut state = self.lock()?;
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
        let mut state = self.lock()?;
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
        let mut state = self.lock()?;
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
// Secret store
// ---------------------------------------------------------------------------

/// Shared in-memory secret store. Values are held in their at-rest form;
/// callers encrypt before `upsert` and decrypt after lookup.
#[derive(Default, Clone)]
pub struct MemorySecretStore {
    records: Arc<Mutex<BTreeMap<String, SecretRecord>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        MemorySecretStore::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, SecretRecord>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Connection)
    }

    /// Insert or replace a secret's at-rest value.
    pub fn upsert(&self, name: &str, at_rest_value: &str) -> Result<SecretRecord, StoreError> {
        let mut records = self.lock()?;
        let now = Utc::now();
        let record = match records.get(name) {
            Some(existing) => SecretRecord {
                value: Redacted::new(at_rest_value),
                updated_at: now,
                ..existing.clone()
            },
            None => SecretRecord {
                id: Uuid::now_v7(),
                name: name.to_string(),
                value: Redacted::new(at_rest_value),
                created_at: now,
                updated_at: now,
            },
        };
        records.insert(name.to_string(), record.clone());
        Ok(record)
    }

    pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(name).is_some())
    }

    /// Stored secret names, sorted.
    pub fn names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }
}

impl SecretStore for MemorySecretStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.lock()?.get(name).cloned())
    }

    async fn find_many_by_names(&self, names: &[String]) -> Result<Vec<SecretRecord>, StoreError> {
        let records = self.lock()?;
        Ok(names
            .iter()
            .filter_map(|n| records.get(n).cloned())
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn run(workflow_id: Uuid, created_at: DateTime<Utc>) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version_id: Uuid::now_v7(),
            trigger_id: None,
            event_id: None,
            status: RunStatus::Queued,
            input: json!({}),
            overrides: None,
            error: None,
            started_at: None,
            finished_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn step_run(run_id: Uuid, step_key: &str) -> StepRun {
        let now = Utc::now();
        StepRun {
            id: Uuid::now_v7(),
            run_id,
            step_key: step_key.to_string(),
            step_type: "transform".to_string(),
            status: RunStatus::Queued,
            attempt: 0,
            request_override: None,
            input: None,
            output: None,
            error: None,
            duration_ms: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_leaves_no_trace() {
        let store = MemoryWorkflowStore::new();
        let workflow_id = Uuid::now_v7();
        let the_run = run(workflow_id, Utc::now());
        let run_id = the_run.id;

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_run(the_run).await.unwrap();
            // Dropped without commit.
        }
        assert!(store.run(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible_atomically() {
        let store = MemoryWorkflowStore::new();
        let workflow_id = Uuid::now_v7();
        let the_run = run(workflow_id, Utc::now());
        let run_id = the_run.id;
        let step = step_run(run_id, "fetch");
        let step_id = step.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_run(the_run).await.unwrap();
        tx.insert_step_run(step).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.run(run_id).await.unwrap().is_some());
        let steps = store.step_runs(run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id, step_id);
    }

    #[tokio::test]
    async fn test_finish_run_inside_transaction_applies_to_staged_row() {
        let store = MemoryWorkflowStore::new();
        let the_run = run(Uuid::now_v7(), Utc::now());
        let run_id = the_run.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_run(the_run).await.unwrap();
        tx.finish_run(run_id, RunStatus::Succeeded, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let stored = store.run(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Succeeded);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_guarded_run_transitions() {
        let store = MemoryWorkflowStore::new();
        let the_run = run(Uuid::now_v7(), Utc::now());
        let run_id = the_run.id;
        let mut tx = store.begin().await.unwrap();
        tx.insert_run(the_run).await.unwrap();
        tx.commit().await.unwrap();

        store
            .mark_run_running_if_queued(run_id, Utc::now())
            .await
            .unwrap();
        let first_start = store.run(run_id).await.unwrap().unwrap().started_at;

        // A duplicate delivery does not reset started_at.
        store
            .mark_run_running_if_queued(run_id, Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(store.run(run_id).await.unwrap().unwrap().started_at, first_start);

        store
            .finish_run_if_active(run_id, RunStatus::Failed, Utc::now())
            .await
            .unwrap();
        // Terminal status sticks.
        store
            .finish_run_if_active(run_id, RunStatus::Succeeded, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.run(run_id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_latest_succeeded_output_ignores_failed_attempts() {
        let store = MemoryWorkflowStore::new();
        let run_id = Uuid::now_v7();
        let failed = step_run(run_id, "fetch");
        let succeeded = step_run(run_id, "fetch");
        let failed_id = failed.id;
        let succeeded_id = succeeded.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_step_run(failed).await.unwrap();
        tx.insert_step_run(succeeded).await.unwrap();
        tx.commit().await.unwrap();

        store
            .fail_step_run(failed_id, json!({ "message": "boom" }), Utc::now())
            .await
            .unwrap();
        store
            .complete_step_run(succeeded_id, json!({ "ok": true }), json!({}), 12, Utc::now())
            .await
            .unwrap();

        let output = store
            .latest_succeeded_output(run_id, "fetch")
            .await
            .unwrap();
        assert_eq!(output, Some(json!({ "ok": true })));
        assert!(store
            .latest_succeeded_output(run_id, "other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fail_step_runs_if_queued_skips_started_rows() {
        let store = MemoryWorkflowStore::new();
        let run_id = Uuid::now_v7();
        let queued = step_run(run_id, "a");
        let started = step_run(run_id, "b");
        let queued_id = queued.id;
        let started_id = started.id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_step_run(queued).await.unwrap();
        tx.insert_step_run(started).await.unwrap();
        tx.commit().await.unwrap();
        store.start_step_run(started_id, 1, Utc::now()).await.unwrap();

        let changed = store
            .fail_step_runs_if_queued(
                &[queued_id, started_id],
                json!({ "message": "enqueue failed" }),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(
            store.step_run(queued_id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            store.step_run(started_id).await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_list_runs_most_recent_first_with_limit() {
        let store = MemoryWorkflowStore::new();
        let workflow_id = Uuid::now_v7();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3i64 {
            let r = run(workflow_id, base + Duration::seconds(i));
            ids.push(r.id);
            let mut tx = store.begin().await.unwrap();
            tx.insert_run(r).await.unwrap();
            tx.commit().await.unwrap();
        }

        let listed = store.list_runs(workflow_id, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
    }

    #[tokio::test]
    async fn test_secret_store_upsert_and_lookup() {
        let secrets = MemorySecretStore::new();
        let created = secrets.upsert("slack_webhook", "enc:v1:n:c").unwrap();
        let replaced = secrets.upsert("slack_webhook", "enc:v1:n2:c2").unwrap();
        assert_eq!(created.id, replaced.id);

        let found = secrets.find_by_name("slack_webhook").await.unwrap().unwrap();
        assert_eq!(found.value.expose(), "enc:v1:n2:c2");

        let many = secrets
            .find_many_by_names(&["slack_webhook".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 1);

        assert!(secrets.delete("slack_webhook").unwrap());
        assert!(!secrets.delete("slack_webhook").unwrap());
    }
}
