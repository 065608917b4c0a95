//! The `transform` executor: declarative JSON reshaping via JMESPath.
//!
//! The request's `output` field is an arbitrary JSON template. Object nodes
//! of the exact shape `{"$jmes": "<expr>"}` are replaced by the expression's
//! result; everything else is copied through, recursing into arrays and
//! objects. Expressions evaluate against a root document with four views:
//!
//! - `input`        -- the merged run input
//! - `source`       -- literal data from the request itself
//! - `steps`        -- dependency outputs with HTTP envelopes unwrapped to
//!                     their bodies, the shape expressions usually want
//! - `stepResponses` -- the same outputs untouched (status code, headers)

use runloom_types::envelope;
use runloom_types::workflow::TransformRequestSpec;
use serde_json::{Map, Value, json};

use super::{ExecutorError, ExecutorInput, ExecutorOutput, StepExecutor};

/// Key marking a JMESPath escape node inside an output template.
pub const JMES_KEY: &str = "$jmes";

pub struct TransformExecutor;

impl StepExecutor for TransformExecutor {
    fn step_type(&self) -> &'static str {
        "transform"
    }

    async fn execute(&self, input: &ExecutorInput) -> Result<ExecutorOutput, ExecutorError> {
        let spec: TransformRequestSpec =
            serde_json::from_value(input.request.clone()).map_err(|err| {
                ExecutorError::InvalidRequest {
                    step_type: "transform",
                    message: err.to_string(),
                }
            })?;

        let root = root_context(input, spec.source.as_ref());
        let body = evaluate_template(&spec.output, &root)?;
        Ok(ExecutorOutput::pure(body))
    }
}

/// The document JMESPath expressions evaluate against.
pub(crate) fn root_context(input: &ExecutorInput, source: Option<&Map<String, Value>>) -> Value {
    json!({
        "input": Value::Object(input.input.clone()),
        "source": Value::Object(source.cloned().unwrap_or_default()),
        "steps": Value::Object(unwrap_step_bodies(&input.steps)),
        "stepResponses": Value::Object(input.steps.clone()),
    })
}

/// Collapse each step output to its HTTP body when it has one, and strip
/// the body's read envelope. Non-HTTP outputs pass through.
fn unwrap_step_bodies(steps: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, output) in steps {
        let unwrapped = match output.get("body") {
            Some(body) => envelope::unwrap_data(body).clone(),
            None => output.clone(),
        };
        out.insert(key.clone(), unwrapped);
    }
    out
}

/// Walk an output template, replacing sole-key `$jmes` nodes with their
/// evaluated result.
fn evaluate_template(node: &Value, root: &Value) -> Result<Value, ExecutorError> {
    match node {
        Value::Object(map) if map.len() == 1 && map.contains_key(JMES_KEY) => {
            match map.get(JMES_KEY) {
                Some(Value::String(expr)) if !expr.trim().is_empty() => search(expr, root),
                _ => Err(ExecutorError::InvalidRequest {
                    step_type: "transform",
                    message: format!("{JMES_KEY} expression must be a non-empty string"),
                }),
            }
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), evaluate_template(value, root)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_template(item, root)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate one JMESPath expression against `root`.
pub(crate) fn search(expr: &str, root: &Value) -> Result<Value, ExecutorError> {
    let compiled =
        jmespath::compile(expr).map_err(|err| ExecutorError::Query(err.to_string()))?;
    let data = jmespath::Variable::from_serializable(root)
        .map_err(|err| ExecutorError::Query(err.to_string()))?;
    let result = compiled
        .search(data)
        .map_err(|err| ExecutorError::Query(err.to_string()))?;
    serde_json::to_value(result.as_ref()).map_err(|err| ExecutorError::Query(err.to_string()))
}

// ===========================================================================
// Tests
// ===========================================================================
