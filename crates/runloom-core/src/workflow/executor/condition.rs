//! The `condition` executor: a JMESPath truthiness probe over run state.
//!
//! Evaluates `expr` against the same root document as `transform`. With
//! `assert` enabled (the default) a falsy result fails the step, which fails
//! the run once retries exhaust; with `assert: false` the step always
//! succeeds and merely records the verdict for downstream steps.
//!
//! Evaluation errors do not fail the step directly: a broken expression
//! evaluates to null, which is falsy, so an asserting condition still trips.

use runloom_types::workflow::ConditionRequestSpec;
use serde_json::{Value, json};

use super::transform::{root_context, search};
use super::{ExecutorError, ExecutorInput, ExecutorOutput, StepExecutor};

pub struct ConditionExecutor;

impl StepExecutor for ConditionExecutor {
    fn step_type(&self) -> &'static str {
        "condition"
    }

    async fn execute(&self, input: &ExecutorInput) -> Result<ExecutorOutput, ExecutorError> {
        let spec: ConditionRequestSpec =
            serde_json::from_value(input.request.clone()).map_err(|err| {
                ExecutorError::InvalidRequest {
                    step_type: "condition",
                    message: err.to_string(),
                }
            })?;

        let root = root_context(input, spec.source.as_ref());
        let value = match search(&spec.expr, &root) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(expr = spec.expr.as_str(), error = %err, "condition expression failed to evaluate");
                Value::Null
            }
        };

        let passed = is_jmes_truthy(&value);
        if spec.assert_enabled() && !passed {
            return Err(ExecutorError::ConditionFailed {
                message: spec.message.clone(),
            });
        }

        Ok(ExecutorOutput::pure(json!({
            "passed": passed,
            "value": value,
        })))
    }
}

/// JMESPath truthiness: null, false, and empty strings/arrays/objects are
/// falsy; numbers (zero included) are truthy.
pub fn is_jmes_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
