//! Step executor trait, boxing adapter, and registry.
//!
//! [`StepExecutor`] is the extension point for step types. The trait uses
//! RPITIT (`impl Future`) for ergonomics; [`StepExecutorDyn`] plus
//! [`BoxStepExecutor`] provide the object-safe boxed form the registry
//! stores. The `transform` and `condition` executors live here because they
//! are pure; the `http` executor lives in the infrastructure crate with the
//! HTTP client.

pub mod condition;
pub mod transform;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("no executor registered for step type '{0}'")]
    UnknownStepType(String),

    #[error("invalid {step_type} request: {message}")]
    InvalidRequest {
        step_type: &'static str,
        message: String,
    },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("http request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("response body exceeded {limit} bytes after reading {bytes_read}")]
    BodyTooLarge { bytes_read: usize, limit: usize },

    #[error("JMESPath evaluation failed: {0}")]
    Query(String),

    #[error("Condition failed{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    ConditionFailed { message: Option<String> },
}

/// What an executor runs against: the fully resolved request plus the run
/// state expressions may reach into. Decrypted secrets are deliberately not
/// part of this; they only exist inside resolved request strings.
#[derive(Debug, Clone)]
pub struct ExecutorInput {
    /// The step's request spec after override merge and template resolution.
    pub request: Value,
    /// Merged run input (workflow defaults, caller input, step input).
    pub input: Map<String, Value>,
    /// Dependency outputs keyed by step key, persistence envelopes stripped.
    pub steps: Map<String, Value>,
}

/// Uniform result shape across step types; `http` fills all fields, the
/// pure executors report a synthetic 200.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorOutput {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Value,
}

impl ExecutorOutput {
    /// A bodyless success from a pure executor.
    pub fn pure(body: Value) -> Self {
        ExecutorOutput {
            status_code: 200,
            headers: None,
            body,
        }
    }

    /// The output as the JSON value persisted on the step run.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// A step-type implementation.
pub trait StepExecutor: Send + Sync {
    /// The step-type tag this executor handles (`http`, `transform`, ...).
    fn step_type(&self) -> &'static str;

    /// Execute one resolved request.
    fn execute(
        &self,
        input: &ExecutorInput,
    ) -> impl Future<Output = Result<ExecutorOutput, ExecutorError>> + Send;
}

/// Object-safe companion to [`StepExecutor`], for registry storage.
pub trait StepExecutorDyn: Send + Sync {
    fn step_type(&self) -> &'static str;

    fn execute_boxed<'a>(
        &'a self,
        input: &'a ExecutorInput,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput, ExecutorError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn step_type(&self) -> &'static str {
        StepExecutor::step_type(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: &'a ExecutorInput,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutorOutput, ExecutorError>> + Send + 'a>> {
        Box::pin(StepExecutor::execute(self, input))
    }
}

/// A boxed executor with the ergonomic async API restored.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        BoxStepExecutor {
            inner: Box::new(executor),
        }
    }

    pub fn step_type(&self) -> &'static str {
        self.inner.step_type()
    }

    pub async fn execute(&self, input: &ExecutorInput) -> Result<ExecutorOutput, ExecutorError> {
        self.inner.execute_boxed(input).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor")
            .field("step_type", &self.step_type())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Step-type -> executor mapping, shared by every processor invocation.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<BoxStepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        ExecutorRegistry::default()
    }

    /// A registry with the pure executors pre-registered.
    pub fn with_pure_executors() -> Self {
        let registry = ExecutorRegistry::new();
        registry.register(transform::TransformExecutor);
        registry.register(condition::ConditionExecutor);
        registry
    }

    /// Register an executor under its own step type. Re-registering a type
    /// replaces the previous executor.
    pub fn register<T: StepExecutor + 'static>(&self, executor: T) {
        let boxed = BoxStepExecutor::new(executor);
        let step_type = boxed.step_type();
        tracing::debug!(step_type, "registered step executor");
        self.executors.insert(step_type.to_string(), Arc::new(boxed));
    }

    /// Look up the executor for a step type.
    pub fn get(&self, step_type: &str) -> Result<Arc<BoxStepExecutor>, ExecutorError> {
        self.executors
            .get(step_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExecutorError::UnknownStepType(step_type.to_string()))
    }

    /// Registered step types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

// ===========================================================================
// Tests
// ===========================================================================
