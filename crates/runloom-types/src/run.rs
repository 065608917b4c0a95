//! Run-time records: workflow runs and step runs.
//!
//! A `WorkflowRun` is one execution of a workflow version, fanned out into
//! one `StepRun` per step in the definition. Both move through the same
//! four-state lifecycle and both keep JSON snapshots (input, output, error)
//! that have already been passed through the persistence envelope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::job::RequestOverride;

// ---------------------------------------------------------------------------
// Status lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle status shared by runs and step runs.
///
/// `QUEUED -> RUNNING -> SUCCEEDED | FAILED`. Retries re-enter `RUNNING`
/// from `FAILED`, so `FAILED` is only authoritative once attempts are
/// exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Terminal states are never left by the engine itself.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// One execution of a workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    /// The trigger this run was started through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<Uuid>,
    /// The trigger event that started this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub status: RunStatus,
    /// Merged run input: workflow defaults under caller input.
    #[serde(default)]
    pub input: Value,
    /// Normalized per-step request overrides, keyed by step key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<BTreeMap<String, RequestOverride>>,
    /// Structured failure detail when `status` is `FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StepRun
// ---------------------------------------------------------------------------

/// One step's execution state within a run.
///
/// `input`, `output`, and `error` hold persistence envelopes (see
/// [`crate::envelope`]), not raw executor values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Step key from the workflow definition.
    pub step_key: String,
    /// Step type tag (`http`, `transform`, `condition`).
    pub step_type: String,
    pub status: RunStatus,
    /// Delivery attempts consumed so far; 0 until first pickup.
    pub attempt: u32,
    /// Caller-supplied per-step request override, applied before resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_override: Option<RequestOverride>,
    /// Resolved request snapshot (enveloped).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Step result (enveloped). Read back by downstream template resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// `{ "message": ..., "stack": ... }` from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Wall-clock execution time of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepRun {
    /// Whether this step run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
