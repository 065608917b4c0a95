//! Queue job contract for step execution.
//!
//! The orchestrator enqueues one job per step run; workers claim the payload
//! and execute the step. Identity fields point back at store rows, while
//! `input` and `requestOverride` are carried inline so a worker can start
//! without re-reading the run row.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request override
// ---------------------------------------------------------------------------

/// Caller-supplied per-step override, merged into the step's static request
/// before template resolution. Only `query` and `body` may be overridden.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestOverride {
    /// True when the override carries nothing and can be dropped.
    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.body.is_none()
    }
}

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

/// Payload delivered to a worker for one step run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRunJob {
    pub workflow_run_id: Uuid,
    pub step_run_id: Uuid,
    pub step_key: String,
    pub workflow_version_id: Uuid,
    /// Merged run input (workflow defaults under caller input).
    #[serde(default = "empty_object")]
    pub input: Value,
    /// Step keys this step depends on, after inference.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_override: Option<RequestOverride>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Enqueue options
// ---------------------------------------------------------------------------

/// Retry backoff strategy for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            kind: BackoffKind::Exponential,
            delay_ms: default_backoff_delay_ms(),
        }
    }
}

/// Options applied when a step-run job is enqueued.
///
/// Defaults match the engine-wide retry policy: three attempts with
/// exponential backoff starting at five seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    /// Stable job identity; the queue de-duplicates on it. The orchestrator
    /// always uses the step-run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Job ids this job must wait on; it becomes runnable only once all of
    /// them are terminal in the queue's own bookkeeping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// How many completed jobs the queue retains for inspection.
    #[serde(default = "default_retention")]
    pub remove_on_complete: usize,
    /// How many failed jobs the queue retains for inspection.
    #[serde(default = "default_retention")]
    pub remove_on_fail: usize,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        EnqueueOptions {
            job_id: None,
            attempts: default_attempts(),
            backoff: Backoff::default(),
            depends_on: Vec::new(),
            remove_on_complete: default_retention(),
            remove_on_fail: default_retention(),
        }
    }
}

impl EnqueueOptions {
    /// Options for a step-run job: identity pinned to the step-run id plus
    /// the job ids of its dependency steps.
    pub fn for_step_run(step_run_id: Uuid, depends_on: Vec<String>) -> Self {
        EnqueueOptions {
            job_id: Some(step_run_id.to_string()),
            depends_on,
            ..EnqueueOptions::default()
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    5000
}

fn default_retention() -> usize {
    1000
}

// ===========================================================================
// Tests
// ===========================================================================
