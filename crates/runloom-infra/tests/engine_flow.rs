//! End-to-end engine flow over the in-memory infrastructure: service-created
//! workflows, orchestrated runs, and a drained queue driving the processor.

use std::sync::Arc;

use runloom_core::repository::secret::SecretCipher;
use runloom_core::repository::workflow::WorkflowStore;
use runloom_core::service::workflow::WorkflowService;
use runloom_core::workflow::executor::ExecutorRegistry;
use runloom_core::workflow::orchestrator::{Orchestrator, StartWorkflowParams};
use runloom_core::workflow::processor::StepRunProcessor;
use runloom_core::workflow::redact;
use runloom_infra::crypto::cipher::AesGcmSecretCipher;
use runloom_infra::queue::memory::{JobStatus, MemoryStepQueue};
use runloom_infra::store::memory::{MemorySecretStore, MemoryWorkflowStore};
use runloom_types::config::WorkerConfig;
use runloom_types::envelope;
use runloom_types::run::RunStatus;
use runloom_types::workflow::{TriggerType, WorkflowDefinition};
use secrecy::SecretString;
use serde_json::{Value, json};

struct Engine {
    store: Arc<MemoryWorkflowStore>,
    secrets: Arc<MemorySecretStore>,
    cipher: Arc<AesGcmSecretCipher>,
    queue: Arc<MemoryStepQueue>,
    service: WorkflowService<MemoryWorkflowStore, MemorySecretStore>,
    orchestrator: Orchestrator<MemoryWorkflowStore, MemoryStepQueue>,
    processor: StepRunProcessor<MemoryWorkflowStore, MemorySecretStore, AesGcmSecretCipher>,
}

fn engine() -> Engine {
    // First caller installs the subscriber; later calls error and are ignored.
    let _ = runloom_observe::tracing_setup::init_tracing(false);

    let key = SecretString::from(
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string(),
    );
    let store = Arc::new(MemoryWorkflowStore::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let cipher = Arc::new(AesGcmSecretCipher::new(&key).unwrap());
    let queue = Arc::new(MemoryStepQueue::new());

    let service = WorkflowService::new(Arc::clone(&store), Arc::clone(&secrets));
    let orchestrator = Orchestrator::new(Arc::clone(&store), Arc::clone(&queue));
    let processor = StepRunProcessor::new(
        Arc::clone(&store),
        Arc::clone(&secrets),
        Arc::clone(&cipher),
        Arc::new(ExecutorRegistry::with_pure_executors()),
        &WorkerConfig::default(),
    );

    Engine {
        store,
        secrets,
        cipher,
        queue,
        service,
        orchestrator,
        processor,
    }
}

fn definition(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

impl Engine {
    async fn drain(&self) -> runloom_infra::queue::memory::DrainSummary {
        let processor = &self.processor;
        self.queue
            .drain(|job, attempt| async move { processor.process(&job, attempt).await })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_run_with_secret_and_dependency_succeeds_redacted() {
    let engine = engine();
    let webhook = "https://hooks.test/T123/B456";
    engine
        .secrets
        .upsert("slack_webhook", &engine.cipher.encrypt(webhook).unwrap())
        .unwrap();

    let (workflow, version) = engine
        .service
        .create(
            "city-report",
            definition(json!({
                "input": { "city": "Lisbon" },
                "steps": [
                    {
                        "key": "shape",
                        "type": "transform",
                        "request": { "output": { "city": { "$jmes": "input.city" } } }
                    },
                    {
                        "key": "notify",
                        "type": "transform",
                        "dependsOn": ["shape"],
                        "request": {
                            "source": { "url": "{{secret.slack_webhook}}" },
                            "output": {
                                "target": { "$jmes": "source.url" },
                                "city": { "$jmes": "steps.shape.city" }
                            }
                        }
                    }
                ]
            })),
        )
        .await
        .unwrap();

    let started = engine
        .orchestrator
        .start_workflow(StartWorkflowParams::manual(workflow.id, version.id))
        .await
        .unwrap();
    assert_eq!(started.step_run_ids.len(), 2);

    let summary = engine.drain().await;
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);

    let run = engine
        .store
        .run(started.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
    // Workflow default input made it onto the run.
    assert_eq!(run.input, json!({ "city": "Lisbon" }));

    let steps = engine.store.step_runs(run.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == RunStatus::Succeeded));

    let notify = steps.iter().find(|s| s.step_key == "notify").unwrap();
    let output = notify.output.as_ref().unwrap();
    let body = &envelope::unwrap_data(output)["body"];
    assert_eq!(body["city"], json!("Lisbon"));

    // The secret resolved during execution but never reached storage.
    let serialized = output.to_string();
    assert!(!serialized.contains(webhook));
    assert!(serialized.contains(redact::REDACTED));

    // Manual trigger and its event were recorded.
    let triggers = engine.store.triggers_for_workflow(workflow.id).unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].trigger_type, TriggerType::Manual);
    assert_eq!(engine.store.events_for_trigger(triggers[0].id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_failing_condition_exhausts_retries_and_fails_run() {
    let engine = engine();
    let (workflow, version) = engine
        .service
        .create(
            "gated",
            definition(json!({
                "input": { "ok": false },
                "steps": [
                    { "key": "seed", "type": "transform", "request": { "output": 1 } },
                    {
                        "key": "gate",
                        "type": "condition",
                        "request": { "expr": "input.ok", "message": "input not ok" }
                    }
                ]
            })),
        )
        .await
        .unwrap();

    let started = engine
        .orchestrator
        .start_workflow(StartWorkflowParams::manual(workflow.id, version.id))
        .await
        .unwrap();

    let summary = engine.drain().await;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);

    let run = engine
        .store
        .run(started.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let steps = engine.store.step_runs(run.id).await.unwrap();
    let seed = steps.iter().find(|s| s.step_key == "seed").unwrap();
    assert_eq!(seed.status, RunStatus::Succeeded);

    let gate = steps.iter().find(|s| s.step_key == "gate").unwrap();
    assert_eq!(gate.status, RunStatus::Failed);
    assert_eq!(gate.attempt, 3);
    let detail = envelope::unwrap_data(gate.error.as_ref().unwrap());
    assert_eq!(detail["message"], json!("Condition failed: input not ok"));

    // The queue consumed the full retry budget with exponential backoff.
    let job = engine
        .queue
        .jobs()
        .into_iter()
        .find(|j| j.payload.step_key == "gate")
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.backoff_history, vec![5000, 10000]);
}

#[tokio::test]
async fn test_zero_step_workflow_completes_without_enqueueing() {
    let engine = engine();
    let (workflow, version) = engine
        .service
        .create("noop", definition(json!({ "steps": [] })))
        .await
        .unwrap();

    let started = engine
        .orchestrator
        .start_workflow(StartWorkflowParams::manual(workflow.id, version.id))
        .await
        .unwrap();
    assert!(started.step_run_ids.is_empty());
    assert!(engine.queue.jobs().is_empty());

    let run = engine
        .store
        .run(started.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_request_override_reaches_http_request_spec() {
    // Overrides only apply to http steps; this exercises the end-to-end
    // normalization path by starting a run with an override for a step key
    // that exists and one that does not.
    let engine = engine();
    let (workflow, version) = engine
        .service
        .create(
            "fetching",
            definition(json!({
                "steps": [
                    { "key": "seed", "type": "transform", "request": { "output": 1 } }
                ]
            })),
        )
        .await
        .unwrap();

    let mut params = StartWorkflowParams::manual(workflow.id, version.id);
    params.overrides = Some(
        [
            (
                "seed".to_string(),
                serde_json::from_value(json!({ "query": { "page": 2 } })).unwrap(),
            ),
            (
                "ghost".to_string(),
                serde_json::from_value(json!({ "body": { "x": 1 } })).unwrap(),
            ),
        ]
        .into(),
    );
    let started = engine.orchestrator.start_workflow(params).await.unwrap();

    // The unknown step key was dropped during normalization.
    let run = engine
        .store
        .run(started.workflow_run_id)
        .await
        .unwrap()
        .unwrap();
    let overrides = run.overrides.unwrap();
    assert!(overrides.contains_key("seed"));
    assert!(!overrides.contains_key("ghost"));

    let summary = engine.drain().await;
    assert_eq!(summary.completed, 1);
}
