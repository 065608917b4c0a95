//! Definition validation at version-creation time.
//!
//! Runs once per version, not per run. Collects *all* problems instead of
//! failing on the first: duplicate keys, bad `dependsOn` targets, unresolved
//! template references, malformed `$jmes` nodes, and dependency cycles. As a
//! convenience the report also carries the inferred-dependency map, the
//! execution batches (when the graph is acyclic), and every referenced
//! secret, so callers can persist or display them without re-deriving.

use std::collections::{BTreeMap, BTreeSet};

use runloom_types::workflow::{StepDefinition, StepRequest, WorkflowDefinition};
use serde::Serialize;
use serde_json::Value;

use super::dag::{self, GraphError};

/// One problem found in a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// JSON-path-style location, e.g. `steps[0].request.body.text`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, step_key: impl Into<String>, message: String) -> Self {
        ValidationIssue {
            field: Some(field.into()),
            step_key: Some(step_key.into()),
            message,
        }
    }
}

/// A `{{secret.<name>}}` occurrence inside a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_key: Option<String>,
}

/// Everything the validator learned about a definition.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// Template-inferred dependencies per step (explicit `dependsOn` not
    /// included), deduplicated and sorted.
    pub inferred_dependencies: BTreeMap<String, Vec<String>>,
    /// Execution batches over merged dependencies; `None` when cyclic.
    pub batches: Option<Vec<Vec<String>>>,
    pub referenced_secrets: Vec<SecretReference>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow definition. Never fails; problems come back as issues.
pub fn validate_definition(definition: &WorkflowDefinition) -> ValidationReport {
    let mut issues = Vec::new();
    let steps = &definition.steps;
    let all_keys: BTreeSet<&str> = steps.iter().map(|s| s.key.as_str()).collect();
    let workflow_input_keys: BTreeSet<&str> = definition
        .input
        .as_ref()
        .map(|m| m.keys().map(String::as_str).collect())
        .unwrap_or_default();

    check_duplicate_keys(steps, &mut issues);
    check_depends_on(steps, &all_keys, &mut issues);
    check_rate_limits(steps, &mut issues);

    let inferred_dependencies =
        check_template_references(steps, &all_keys, &workflow_input_keys, &mut issues);

    check_transform_queries(steps, &mut issues);

    // Cycle detection over explicit + inferred dependencies. Unknown and
    // self-referential entries were already reported; they carry no edge.
    let merged: Vec<(String, Vec<String>)> = steps
        .iter()
        .map(|step| {
            let mut deps: Vec<String> = step
                .depends_on
                .iter()
                .filter(|d| all_keys.contains(d.as_str()) && **d != step.key)
                .cloned()
                .collect();
            for dep in inferred_dependencies.get(&step.key).into_iter().flatten() {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            (step.key.clone(), deps)
        })
        .collect();
    let nodes: Vec<(&str, &[String])> = merged
        .iter()
        .map(|(key, deps)| (key.as_str(), deps.as_slice()))
        .collect();

    let batches = match dag::compute_batches(&nodes) {
        Ok(batches) => Some(batches),
        Err(GraphError::DependencyCycle { keys }) => {
            issues.push(ValidationIssue {
                field: Some("steps".to_string()),
                step_key: Some(keys.join(",")),
                message: format!(
                    "Dependency cycle detected (explicit or template-based). Steps involved: {}",
                    keys.join(", ")
                ),
            });
            None
        }
    };

    ValidationReport {
        issues,
        inferred_dependencies,
        batches,
        referenced_secrets: referenced_secrets(definition),
    }
}

fn check_duplicate_keys(steps: &[StepDefinition], issues: &mut Vec<ValidationIssue>) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for step in steps {
        *counts.entry(step.key.as_str()).or_insert(0) += 1;
    }
    for (key, count) in counts {
        if count > 1 {
            issues.push(ValidationIssue::new(
                "steps",
                key,
                format!("Duplicate step key: \"{key}\""),
            ));
        }
    }
}

fn check_depends_on(
    steps: &[StepDefinition],
    all_keys: &BTreeSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    for (i, step) in steps.iter().enumerate() {
        for (j, dep) in step.depends_on.iter().enumerate() {
            if *dep == step.key {
                issues.push(ValidationIssue::new(
                    format!("steps[{i}].dependsOn[{j}]"),
                    &step.key,
                    format!("stepKey={}: dependsOn cannot reference itself", step.key),
                ));
            } else if !all_keys.contains(dep.as_str()) {
                issues.push(ValidationIssue::new(
                    format!("steps[{i}].dependsOn[{j}]"),
                    &step.key,
                    format!(
                        "stepKey={}: dependsOn references unknown step \"{dep}\"",
                        step.key
                    ),
                ));
            }
        }
    }
}

/// Rate-limit keys name shared windows, so they must be stable identifiers.
fn check_rate_limits(steps: &[StepDefinition], issues: &mut Vec<ValidationIssue>) {
    for (i, step) in steps.iter().enumerate() {
        let Some(limit) = &step.rate_limit else {
            continue;
        };
        if limit.key.is_empty()
            || !limit
                .key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            issues.push(ValidationIssue::new(
                format!("steps[{i}].rateLimit.key"),
                &step.key,
                format!(
                    "stepKey={}: rateLimit.key must match [A-Za-z0-9_]+",
                    step.key
                ),
            ));
        }
        if limit.max == 0 {
            issues.push(ValidationIssue::new(
                format!("steps[{i}].rateLimit.max"),
                &step.key,
                format!("stepKey={}: rateLimit.max must be greater than 0", step.key),
            ));
        }
        if limit.per_seconds == 0 {
            issues.push(ValidationIssue::new(
                format!("steps[{i}].rateLimit.perSeconds"),
                &step.key,
                format!(
                    "stepKey={}: rateLimit.perSeconds must be greater than 0",
                    step.key
                ),
            ));
        }
    }
}

/// Scan every string in every request for step and input references. Unknown
/// step references and undeclared input fields become issues; known non-self
/// step references feed the inferred-dependency map.
fn check_template_references(
    steps: &[StepDefinition],
    all_keys: &BTreeSet<&str>,
    workflow_input_keys: &BTreeSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) -> BTreeMap<String, Vec<String>> {
    let mut inferred: BTreeMap<String, BTreeSet<String>> = steps
        .iter()
        .map(|s| (s.key.clone(), BTreeSet::new()))
        .collect();

    for (i, step) in steps.iter().enumerate() {
        let mut allowed_input_keys = workflow_input_keys.clone();
        if let Some(step_input) = &step.input {
            allowed_input_keys.extend(step_input.keys().map(String::as_str));
        }

        let request = step.request.payload_json();
        walk(&request, format!("steps[{i}].request"), &mut |value, path| {
            let Value::String(text) = value else { return };

            for reference in dag::scan_references(text, "steps.", true) {
                if !all_keys.contains(reference.as_str()) {
                    issues.push(ValidationIssue::new(
                        path,
                        &step.key,
                        format!(
                            "stepKey={}: references unknown step \"{reference}\"",
                            step.key
                        ),
                    ));
                } else if reference != step.key {
                    if let Some(set) = inferred.get_mut(&step.key) {
                        set.insert(reference);
                    }
                }
            }

            for reference in dag::scan_references(text, "input.", true) {
                if !allowed_input_keys.contains(reference.as_str()) {
                    issues.push(ValidationIssue::new(
                        path,
                        &step.key,
                        format!(
                            "stepKey={}: input field \"{reference}\" must be declared in workflow definition.input or step.input",
                            step.key
                        ),
                    ));
                }
            }
        });
    }

    inferred
        .into_iter()
        .map(|(key, set)| (key, set.into_iter().collect()))
        .collect()
}

/// For transform steps, every `$jmes` escape node must be the sole key of
/// its object and carry a compilable, non-empty expression.
fn check_transform_queries(steps: &[StepDefinition], issues: &mut Vec<ValidationIssue>) {
    for (i, step) in steps.iter().enumerate() {
        let StepRequest::Transform(spec) = &step.request else {
            continue;
        };
        walk_jmes(
            &spec.output,
            format!("steps[{i}].request.output"),
            &step.key,
            issues,
        );
    }
}

fn walk_jmes(node: &Value, path: String, step_key: &str, issues: &mut Vec<ValidationIssue>) {
    match node {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk_jmes(item, format!("{path}[{i}]"), step_key, issues);
            }
        }
        Value::Object(map) => {
            if map.contains_key("$jmes") {
                if map.len() != 1 {
                    issues.push(ValidationIssue::new(
                        &path,
                        step_key,
                        format!("stepKey={step_key}: $jmes node must be exactly {{ \"$jmes\": \"...\" }}"),
                    ));
                }
                match map.get("$jmes") {
                    Some(Value::String(expr)) if !expr.trim().is_empty() => {
                        if let Err(err) = jmespath::compile(expr) {
                            issues.push(ValidationIssue::new(
                                format!("{path}.$jmes"),
                                step_key,
                                format!("stepKey={step_key}: invalid JMESPath expression: {err}"),
                            ));
                        }
                    }
                    _ => {
                        issues.push(ValidationIssue::new(
                            format!("{path}.$jmes"),
                            step_key,
                            format!("stepKey={step_key}: $jmes expression must be a non-empty string"),
                        ));
                    }
                }
                return;
            }
            for (key, value) in map {
                walk_jmes(value, format!("{path}.{key}"), step_key, issues);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Secret references
// ---------------------------------------------------------------------------

/// Collect every `{{secret.<name>}}` occurrence from the definition input
/// and every step request, in document order.
pub fn referenced_secrets(definition: &WorkflowDefinition) -> Vec<SecretReference> {
    let mut refs = Vec::new();

    if let Some(input) = &definition.input {
        let input = Value::Object(input.clone());
        walk(&input, "input".to_string(), &mut |value, path| {
            let Value::String(text) = value else { return };
            for name in dag::scan_references(text, "secret.", false) {
                refs.push(SecretReference {
                    name,
                    field: path.to_string(),
                    step_key: None,
                });
            }
        });
    }

    for (i, step) in definition.steps.iter().enumerate() {
        let request = step.request.payload_json();
        walk(&request, format!("steps[{i}].request"), &mut |value, path| {
            let Value::String(text) = value else { return };
            for name in dag::scan_references(text, "secret.", false) {
                refs.push(SecretReference {
                    name,
                    field: path.to_string(),
                    step_key: Some(step.key.clone()),
                });
            }
        });
    }

    refs
}

fn walk(node: &Value, path: String, visit: &mut impl FnMut(&Value, &str)) {
    visit(node, &path);
    match node {
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, format!("{path}[{i}]"), visit);
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                walk(value, format!("{path}.{key}"), visit);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
