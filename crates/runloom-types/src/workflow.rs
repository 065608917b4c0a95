//! Workflow domain types for Runloom.
//!
//! Defines the canonical representation for versioned workflow definitions:
//! a workflow owns immutable versions, each version carries a declarative
//! graph of typed steps (`http`, `transform`, `condition`). The persisted
//! JSON wire format is camelCase and is the single source of truth shared by
//! the orchestrator, the validator, and the worker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow / WorkflowVersion records
// ---------------------------------------------------------------------------

/// A named workflow. Owns zero or more immutable versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Inactive workflows are not started by triggers.
    pub is_active: bool,
    /// Most recent version; advanced atomically with version creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable version of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Monotonic version number starting at 1.
    pub version: u32,
    pub definition: WorkflowDefinition,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow Definition (persisted JSON)
// ---------------------------------------------------------------------------

/// The declarative workflow definition persisted on a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow-level default input, merged under caller input at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Steps forming the workflow DAG.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step definition by key.
    pub fn find_step(&self, key: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Workflow-level default input as an owned map (empty when absent).
    pub fn default_input(&self) -> Map<String, Value> {
        self.input.clone().unwrap_or_default()
    }
}

/// A single step in a workflow definition.
///
/// Wire format keeps `type` and `request` as sibling fields:
/// ```json
/// { "key": "fetch", "type": "http", "request": { "method": "GET", ... } }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Addressable identity of the step within a version. Unique, matches
    /// `[a-zA-Z0-9_-]+`; referenced by templates and by `dependsOn`.
    pub key: String,
    /// Type-specific request spec, tagged by the sibling `type` field.
    #[serde(flatten)]
    pub request: StepRequest,
    /// Explicit dependencies on other step keys (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Step-level input defaults, merged over the run input for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Size policy for this step's persisted output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_policy: Option<OutputPolicy>,
    /// Fixed-window rate limit applied before the step executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
}

impl StepDefinition {
    /// The step's type tag as carried on the wire.
    pub fn step_type(&self) -> &'static str {
        self.request.step_type()
    }

    /// Step-level input as an owned map (empty when absent).
    pub fn step_input(&self) -> Map<String, Value> {
        self.input.clone().unwrap_or_default()
    }
}

/// Type-specific request payload for a step.
///
/// Adjacently tagged so `type` and `request` land as sibling fields of the
/// step object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "request", rename_all = "lowercase")]
pub enum StepRequest {
    /// An outbound HTTP call.
    Http(HttpRequestSpec),
    /// A declarative JSON reshaping of prior outputs.
    Transform(TransformRequestSpec),
    /// A JMESPath assertion / boolean probe.
    Condition(ConditionRequestSpec),
}

impl StepRequest {
    /// The wire tag for this request kind.
    pub fn step_type(&self) -> &'static str {
        match self {
            StepRequest::Http(_) => "http",
            StepRequest::Transform(_) => "transform",
            StepRequest::Condition(_) => "condition",
        }
    }

    /// The bare request spec as a JSON value (without the `type` tag), the
    /// shape templates are scanned over and executors receive.
    pub fn payload_json(&self) -> Value {
        let payload = match self {
            StepRequest::Http(spec) => serde_json::to_value(spec),
            StepRequest::Transform(spec) => serde_json::to_value(spec),
            StepRequest::Condition(spec) => serde_json::to_value(spec),
        };
        payload.unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Request specs
// ---------------------------------------------------------------------------

/// HTTP method for an `http` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Methods that carry a JSON request body by default.
    pub fn is_mutating(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request spec for an `http` step.
///
/// `url` may be an absolute http(s) URL or contain template references that
/// resolve to one at run time. Query values accept strings, numbers, and
/// booleans; everything is stringified when the URL is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Request timeout; the executor default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Request spec for a `transform` step.
///
/// `output` is an arbitrary JSON template; object nodes of the exact shape
/// `{"$jmes": "<expr>"}` are replaced by the expression's result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformRequestSpec {
    /// Literal data exposed to expressions as `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Map<String, Value>>,
    #[serde(default)]
    pub output: Value,
}

/// Request spec for a `condition` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRequestSpec {
    /// JMESPath expression evaluated against the step context.
    pub expr: String,
    /// When true (the default), a falsy result fails the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<bool>,
    /// Appended to the failure message when the assertion trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Literal data exposed to the expression as `source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Map<String, Value>>,
}

impl ConditionRequestSpec {
    /// Whether a falsy result fails the step (defaults to true).
    pub fn assert_enabled(&self) -> bool {
        self.assert.unwrap_or(true)
    }
}

/// Size policy for a step's persisted output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<usize>,
}

/// Fixed-window rate limit for a step, shared across runs via `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    /// Window identity, `[A-Za-z0-9_]+`. Steps sharing a key share a window.
    pub key: String,
    /// Maximum executions per window.
    pub max: u32,
    /// Window length in seconds.
    pub per_seconds: u64,
}

// ---------------------------------------------------------------------------
// Triggers and events
// ---------------------------------------------------------------------------

/// How a workflow run gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerType {
    Manual,
    Webhook,
    Cron,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Manual => f.write_str("MANUAL"),
            TriggerType::Webhook => f.write_str("WEBHOOK"),
            TriggerType::Cron => f.write_str("CRON"),
        }
    }
}

/// A trigger attached to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: Uuid,
    pub workflow_id: Uuid,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub name: String,
    pub is_active: bool,
    /// Type-specific configuration (cron expression, webhook auth, ...).
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

/// One received trigger firing. `(trigger_id, external_id)` is the natural
/// de-duplication key for externally-sourced deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub trigger_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

// ===========================================================================
// Tests
// ===========================================================================
