//! Run orchestration: transactional run creation plus batch-ordered
//! enqueueing.
//!
//! `start_workflow` does its store work inside one transaction -- trigger
//! and event bookkeeping, dependency-graph construction, input merge,
//! override normalization, the run row, one step-run row per step -- and
//! only after commit talks to the queue. Enqueueing walks the execution
//! batches in order, fanning each batch out concurrently and wiring queue
//! dependencies to the job ids of earlier batches. If any enqueue fails,
//! every step run that never made it onto the queue is failed (guarded on
//! `QUEUED`), the run is failed, and the error is re-raised; steps already
//! enqueued are left for their workers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use runloom_types::error::{QueueError, StoreError};
use runloom_types::job::{EnqueueOptions, RequestOverride, StepRunJob};
use runloom_types::run::{RunStatus, StepRun, WorkflowRun};
use runloom_types::workflow::{Event, StepDefinition, Trigger, TriggerType};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use super::dag::{self, DependencyGraph, GraphError};
use crate::queue::StepQueue;
use crate::repository::workflow::{RunTransaction, WorkflowStore};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("workflow version '{0}' not found")]
    VersionNotFound(Uuid),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to enqueue step runs ({enqueued} of {total} enqueued): {source}")]
    Enqueue {
        enqueued: usize,
        total: usize,
        #[source]
        source: QueueError,
    },
}

/// How to start a run of one workflow version.
pub struct StartWorkflowParams {
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    /// Trigger to attribute the run to; a `Manual` trigger is resolved or
    /// created when absent.
    pub trigger_id: Option<Uuid>,
    /// Event type recorded for the firing; defaults to `MANUAL`.
    pub event_type: Option<String>,
    pub event_external_id: Option<String>,
    pub event_payload: Option<Value>,
    /// Caller-supplied run input; workflow defaults win on key collision.
    pub input: Option<Map<String, Value>>,
    /// Per-step request overrides, keyed by step key.
    pub overrides: Option<BTreeMap<String, RequestOverride>>,
}

impl StartWorkflowParams {
    /// A plain manual start with no input or overrides.
    pub fn manual(workflow_id: Uuid, workflow_version_id: Uuid) -> Self {
        StartWorkflowParams {
            workflow_id,
            workflow_version_id,
            trigger_id: None,
            event_type: None,
            event_external_id: None,
            event_payload: None,
            input: None,
            overrides: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartedRun {
    pub workflow_run_id: Uuid,
    /// Step-run ids in definition order; empty for zero-step workflows.
    pub step_run_ids: Vec<Uuid>,
}

struct EnqueueItem {
    step_key: String,
    step_type: &'static str,
    step_run_id: Uuid,
    payload: StepRunJob,
}

struct CreatedRun {
    run_id: Uuid,
    step_run_ids: Vec<Uuid>,
    items: Vec<EnqueueItem>,
    graph: DependencyGraph,
}

pub struct Orchestrator<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
}

impl<S, Q> Orchestrator<S, Q>
where
    S: WorkflowStore + 'static,
    Q: StepQueue + 'static,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>) -> Self {
        Orchestrator { store, queue }
    }

    /// Create a run of the given version and enqueue its steps.
    pub async fn start_workflow(
        &self,
        params: StartWorkflowParams,
    ) -> Result<StartedRun, OrchestrationError> {
        let span = tracing::info_span!(
            "run.start",
            run.operation.name = "start_run",
            run.workflow.id = %params.workflow_id,
            run.workflow.version_id = %params.workflow_version_id,
        );
        self.start_workflow_impl(params).instrument(span).await
    }

    async fn start_workflow_impl(
        &self,
        params: StartWorkflowParams,
    ) -> Result<StartedRun, OrchestrationError> {
        tracing::info!("starting workflow run");

        let created = self.create_run(&params).await?;
        let total = created.items.len();

        if total == 0 {
            return Ok(StartedRun {
                workflow_run_id: created.run_id,
                step_run_ids: created.step_run_ids,
            });
        }

        match self.enqueue_batches(&created.items, &created.graph).await {
            Ok(()) => {
                tracing::info!(
                    run_id = %created.run_id,
                    steps = total,
                    batches = created.graph.batches.len(),
                    "workflow run enqueued"
                );
                Ok(StartedRun {
                    workflow_run_id: created.run_id,
                    step_run_ids: created.step_run_ids,
                })
            }
            Err((enqueued, source)) => {
                tracing::error!(
                    run_id = %created.run_id,
                    enqueued = enqueued.len(),
                    total,
                    error = %source,
                    "enqueue failed; failing run"
                );
                self.reconcile_enqueue_failure(created.run_id, &created.step_run_ids, &enqueued, &source)
                    .await;
                Err(OrchestrationError::Enqueue {
                    enqueued: enqueued.len(),
                    total,
                    source,
                })
            }
        }
    }

    /// All store writes for one run, committed together.
    async fn create_run(
        &self,
        params: &StartWorkflowParams,
    ) -> Result<CreatedRun, OrchestrationError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let trigger_id = match params.trigger_id {
            Some(id) => id,
            None => resolve_manual_trigger(&mut tx, params.workflow_id).await?,
        };

        let event = Event {
            id: Uuid::now_v7(),
            trigger_id,
            event_type: params
                .event_type
                .clone()
                .unwrap_or_else(|| TriggerType::Manual.to_string()),
            external_id: params.event_external_id.clone(),
            payload: params
                .event_payload
                .clone()
                .or_else(|| params.input.clone().map(Value::Object))
                .unwrap_or_else(|| json!({})),
            received_at: now,
        };
        let event_id = event.id;
        tx.insert_event(event).await?;

        let version = tx
            .workflow_version(params.workflow_version_id)
            .await?
            .ok_or(OrchestrationError::VersionNotFound(params.workflow_version_id))?;
        let definition = &version.definition;

        // Cycles abort here, before anything is committed or enqueued.
        let graph = dag::build_dependency_graph(&definition.steps)?;

        let mut merged_input = params.input.clone().unwrap_or_default();
        for (key, value) in definition.default_input() {
            merged_input.insert(key, value);
        }

        let overrides = normalize_overrides(params.overrides.as_ref(), &definition.steps);

        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: params.workflow_id,
            workflow_version_id: params.workflow_version_id,
            trigger_id: Some(trigger_id),
            event_id: Some(event_id),
            status: RunStatus::Queued,
            input: Value::Object(merged_input.clone()),
            overrides: (!overrides.is_empty()).then(|| overrides.clone()),
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        };
        let run_id = run.id;
        tx.insert_run(run).await?;

        if definition.steps.is_empty() {
            tx.finish_run(run_id, RunStatus::Succeeded, now).await?;
            tx.commit().await?;
            tracing::info!(run_id = %run_id, "zero-step workflow run succeeded immediately");
            return Ok(CreatedRun {
                run_id,
                step_run_ids: Vec::new(),
                items: Vec::new(),
                graph,
            });
        }

        let mut step_run_ids = Vec::with_capacity(definition.steps.len());
        let mut items = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let request_override = overrides.get(&step.key).cloned();
            let step_run = StepRun {
                id: Uuid::now_v7(),
                run_id,
                step_key: step.key.clone(),
                step_type: step.step_type().to_string(),
                status: RunStatus::Queued,
                attempt: 0,
                request_override: request_override.clone(),
                input: None,
                output: None,
                error: None,
                duration_ms: None,
                started_at: None,
                finished_at: None,
                created_at: now,
                updated_at: now,
            };
            let step_run_id = step_run.id;
            tx.insert_step_run(step_run).await?;

            step_run_ids.push(step_run_id);
            items.push(EnqueueItem {
                step_key: step.key.clone(),
                step_type: step.step_type(),
                step_run_id,
                payload: StepRunJob {
                    workflow_run_id: run_id,
                    step_run_id,
                    step_key: step.key.clone(),
                    workflow_version_id: params.workflow_version_id,
                    input: Value::Object(merged_input.clone()),
                    depends_on: graph.dependencies_of(&step.key).to_vec(),
                    request_override,
                },
            });
        }

        tx.commit().await?;
        Ok(CreatedRun {
            run_id,
            step_run_ids,
            items,
            graph,
        })
    }

    /// Enqueue batch by batch; within a batch, concurrently. Returns the
    /// set of step-run ids that made it onto the queue alongside the first
    /// error.
    async fn enqueue_batches(
        &self,
        items: &[EnqueueItem],
        graph: &DependencyGraph,
    ) -> Result<(), (BTreeSet<Uuid>, QueueError)> {
        let by_key: BTreeMap<&str, &EnqueueItem> =
            items.iter().map(|item| (item.step_key.as_str(), item)).collect();

        // Step key -> queue job id, filled as batches complete.
        let mut job_ids: BTreeMap<String, String> = BTreeMap::new();
        let mut enqueued: BTreeSet<Uuid> = BTreeSet::new();

        for batch in &graph.batches {
            let mut join_set = JoinSet::new();
            for key in batch {
                let Some(item) = by_key.get(key.as_str()) else {
                    continue;
                };
                let depends_on_jobs: Vec<String> = graph
                    .dependencies_of(key)
                    .iter()
                    .filter_map(|dep| job_ids.get(dep).cloned())
                    .collect();
                let options = EnqueueOptions::for_step_run(item.step_run_id, depends_on_jobs);

                let queue = Arc::clone(&self.queue);
                let step_key = item.step_key.clone();
                let step_type = item.step_type;
                let step_run_id = item.step_run_id;
                let payload = item.payload.clone();
                join_set.spawn(async move {
                    let result = queue.enqueue(step_type, payload, options).await;
                    (step_key, step_run_id, result)
                });
            }

            let mut failure: Option<QueueError> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_key, step_run_id, Ok(job_id))) => {
                        tracing::debug!(step_key = step_key.as_str(), job_id = job_id.as_str(), "step run enqueued");
                        job_ids.insert(step_key, job_id);
                        enqueued.insert(step_run_id);
                    }
                    Ok((step_key, _, Err(err))) => {
                        tracing::error!(step_key = step_key.as_str(), error = %err, "step run enqueue failed");
                        failure.get_or_insert(err);
                    }
                    Err(join_err) => {
                        failure.get_or_insert(QueueError::Enqueue {
                            job_id: String::new(),
                            message: format!("enqueue task failed: {join_err}"),
                        });
                    }
                }
            }

            if let Some(err) = failure {
                return Err((enqueued, err));
            }
        }

        Ok(())
    }

    /// Fail the steps that never reached the queue, then the run. Best
    /// effort: store errors here are logged, not raised, so the original
    /// enqueue error survives.
    async fn reconcile_enqueue_failure(
        &self,
        run_id: Uuid,
        step_run_ids: &[Uuid],
        enqueued: &BTreeSet<Uuid>,
        source: &QueueError,
    ) {
        let not_enqueued: Vec<Uuid> = step_run_ids
            .iter()
            .filter(|id| !enqueued.contains(id))
            .copied()
            .collect();
        let now = Utc::now();
        let error = json!({
            "message": "Failed to enqueue step run",
            "detail": source.to_string(),
        });

        if !not_enqueued.is_empty() {
            match self
                .store
                .fail_step_runs_if_queued(&not_enqueued, error.clone(), now)
                .await
            {
                Ok(changed) => {
                    tracing::warn!(run_id = %run_id, failed_steps = changed, "failed never-enqueued step runs");
                }
                Err(store_err) => {
                    tracing::error!(run_id = %run_id, error = %store_err, "could not fail never-enqueued step runs");
                }
            }
        }

        if let Err(store_err) = self
            .store
            .finish_run_if_active(run_id, RunStatus::Failed, now)
            .await
        {
            tracing::error!(run_id = %run_id, error = %store_err, "could not fail run after enqueue failure");
        }
    }
}

/// Find the workflow's `Manual` trigger, creating one when missing.
async fn resolve_manual_trigger<Tx: RunTransaction>(
    tx: &mut Tx,
    workflow_id: Uuid,
) -> Result<Uuid, StoreError> {
    if let Some(trigger) = tx.find_trigger(workflow_id, TriggerType::Manual).await? {
        return Ok(trigger.id);
    }

    let trigger = Trigger {
        id: Uuid::now_v7(),
        workflow_id,
        trigger_type: TriggerType::Manual,
        name: "Manual".to_string(),
        is_active: true,
        config: json!({}),
        created_at: Utc::now(),
    };
    let id = trigger.id;
    tx.insert_trigger(trigger).await?;
    Ok(id)
}

/// Keep only overrides that name an existing step and carry content.
fn normalize_overrides(
    overrides: Option<&BTreeMap<String, RequestOverride>>,
    steps: &[StepDefinition],
) -> BTreeMap<String, RequestOverride> {
    let Some(overrides) = overrides else {
        return BTreeMap::new();
    };
    overrides
        .iter()
        .filter(|(key, value)| !value.is_empty() && steps.iter().any(|s| &s.key == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
