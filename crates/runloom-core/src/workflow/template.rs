//! Template resolution for step requests.
//!
//! Requests may reference run state through three `{{...}}` families:
//!
//! - `{{steps.<key>[.<path>]}}` -- a prior step's output (envelopes stripped)
//! - `{{input.<key>[.<path>]}}` -- the merged run input
//! - `{{secret.<name>}}` -- a decrypted secret (no path traversal)
//!
//! A string that is exactly one reference resolves to the *typed* underlying
//! value, so objects, arrays, numbers, and booleans survive substitution. A
//! reference embedded in a larger string is replaced by its string form:
//! objects and arrays as compact JSON, null as the empty string, primitives
//! naturally. Missing steps, input fields, paths, or secrets are hard errors;
//! a step must fail loudly rather than run with a silently defaulted request.

use std::collections::BTreeMap;

use runloom_types::envelope;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("referenced step '{0}' does not exist or has not completed")]
    StepUnavailable(String),

    #[error("path '{path}' not found in step '{step}' output")]
    StepPathMissing { step: String, path: String },

    #[error("input field '{0}' not found in workflow input")]
    InputMissing(String),

    #[error("path '{path}' not found in workflow input field '{field}'")]
    InputPathMissing { field: String, path: String },

    #[error("secret '{0}' not found")]
    SecretMissing(String),
}

/// Run state a request is resolved against.
#[derive(Clone, Default)]
pub struct ResolutionContext {
    /// Merged run input.
    pub input: Map<String, Value>,
    /// Prior step outputs keyed by step key, as persisted (envelopes intact).
    pub steps: Map<String, Value>,
    /// Decrypted secrets by name.
    pub secret: BTreeMap<String, String>,
}

/// The outcome of resolving one value tree.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub resolved: Value,
    /// Step keys referenced anywhere in the tree, first-occurrence order.
    pub referenced_steps: Vec<String>,
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve every template reference in `value` against `ctx`.
///
/// Arrays and objects are resolved element/field-wise; non-string leaves
/// pass through untouched.
pub fn resolve(value: &Value, ctx: &ResolutionContext) -> Result<Resolution, TemplateError> {
    let mut referenced_steps = Vec::new();
    let resolved = resolve_inner(value, ctx, &mut referenced_steps)?;
    Ok(Resolution {
        resolved,
        referenced_steps,
    })
}

fn resolve_inner(
    value: &Value,
    ctx: &ResolutionContext,
    refs: &mut Vec<String>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(template) => resolve_string(template, ctx, refs),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_inner(item, ctx, refs)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, val) in map {
                resolved.insert(key.clone(), resolve_inner(val, ctx, refs)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    template: &str,
    ctx: &ResolutionContext,
    refs: &mut Vec<String>,
) -> Result<Value, TemplateError> {
    // A string that is exactly one reference keeps the value's type.
    if let Some((key, path)) = parse_full_match(template, "steps.", true) {
        push_unique(refs, key);
        let value = resolve_step_reference(key, path, ctx)?;
        return Ok(coerce_full(value));
    }
    if let Some((key, path)) = parse_full_match(template, "input.", true) {
        let value = resolve_input_reference(key, path, ctx)?;
        return Ok(coerce_full(value));
    }
    if let Some((name, _)) = parse_full_match(template, "secret.", false) {
        let value = resolve_secret_reference(name, ctx)?;
        return Ok(coerce_full(value));
    }

    // Embedded references are substituted as strings, one family at a time.
    let result = replace_partial(template, "steps.", true, |key, path| {
        push_unique(refs, key);
        resolve_step_reference(key, path, ctx)
    })?;
    let result = replace_partial(&result, "input.", true, |key, path| {
        resolve_input_reference(key, path, ctx)
    })?;
    let result = replace_partial(&result, "secret.", false, |name, _| {
        resolve_secret_reference(name, ctx)
    })?;

    Ok(Value::String(result))
}

// ---------------------------------------------------------------------------
// Reference lookup
// ---------------------------------------------------------------------------

fn resolve_step_reference(
    key: &str,
    path: Option<&str>,
    ctx: &ResolutionContext,
) -> Result<Value, TemplateError> {
    let step_output = match ctx.steps.get(key) {
        Some(value) if !value.is_null() => value,
        _ => return Err(TemplateError::StepUnavailable(key.to_string())),
    };

    // Strip the persistence envelope, then collapse an HTTP body envelope:
    // `{statusCode, headers, body: {_meta, data}}` resolves to the body data.
    let step_data = envelope::unwrap_data(step_output);
    let data = match step_data {
        Value::Object(map) => match map.get("body") {
            Some(body) if envelope::is_envelope(body) => envelope::unwrap_data(body),
            _ => step_data,
        },
        _ => step_data,
    };

    let Some(raw_path) = path else {
        return Ok(data.clone());
    };
    let clean = clean_reference_path(raw_path, Some("output"));
    if clean.is_empty() {
        return Ok(data.clone());
    }

    get_by_path(data, &clean).ok_or_else(|| TemplateError::StepPathMissing {
        step: key.to_string(),
        path: raw_path.to_string(),
    })
}

fn resolve_input_reference(
    key: &str,
    path: Option<&str>,
    ctx: &ResolutionContext,
) -> Result<Value, TemplateError> {
    let data = ctx
        .input
        .get(key)
        .ok_or_else(|| TemplateError::InputMissing(key.to_string()))?;

    let Some(raw_path) = path else {
        return Ok(data.clone());
    };
    let clean = clean_reference_path(raw_path, None);
    if clean.is_empty() {
        return Ok(data.clone());
    }

    get_by_path(data, &clean).ok_or_else(|| TemplateError::InputPathMissing {
        field: key.to_string(),
        path: raw_path.to_string(),
    })
}

fn resolve_secret_reference(name: &str, ctx: &ResolutionContext) -> Result<Value, TemplateError> {
    ctx.secret
        .get(name)
        .map(|value| Value::String(value.clone()))
        .ok_or_else(|| TemplateError::SecretMissing(name.to_string()))
}

// ---------------------------------------------------------------------------
// Path traversal
// ---------------------------------------------------------------------------

/// Drop the leading dot, trim, and optionally strip a leading segment
/// (step references accept an explicit `output` prefix).
fn clean_reference_path(path: &str, prefix_to_strip: Option<&str>) -> String {
    let mut clean = path.strip_prefix('.').unwrap_or(path).trim();

    if let Some(prefix) = prefix_to_strip {
        if let Some(rest) = clean.strip_prefix(prefix) {
            clean = rest.strip_prefix('.').unwrap_or(rest).trim();
        }
    }

    clean.to_string()
}

/// Walk a dot-separated path. Array segments accept numeric indices.
/// Returns `None` when any segment is missing or hits a non-container.
fn get_by_path(base: &Value, clean_path: &str) -> Option<Value> {
    let mut current = base;
    for part in clean_path.split('.').filter(|p| !p.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => {
                let index: usize = part.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current.clone())
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// Full-match coercion: keep the type, except null which resolves to "".
fn coerce_full(value: Value) -> Value {
    if value.is_null() {
        Value::String(String::new())
    } else {
        value
    }
}

/// Interpolation coercion: null becomes "", containers become compact JSON,
/// primitives use their natural string form.
fn coerce_interpolated(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Reference parsing
// ---------------------------------------------------------------------------

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Parse a string that is exactly `{{ <family><key>[.path] }}`, whitespace
/// tolerant inside the braces. Returns the key and the raw path (leading dot
/// included) when the whole string is one reference.
fn parse_full_match<'a>(
    template: &'a str,
    family: &str,
    allow_path: bool,
) -> Option<(&'a str, Option<&'a str>)> {
    let bytes = template.as_bytes();
    if !template.starts_with("{{") {
        return None;
    }

    let mut i = 2;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if !bytes[i..].starts_with(family.as_bytes()) {
        return None;
    }
    i += family.len();

    let key_start = i;
    while i < bytes.len() && is_key_byte(bytes[i]) {
        i += 1;
    }
    if i == key_start {
        return None;
    }
    let key = &template[key_start..i];

    let mut path = None;
    if allow_path && i < bytes.len() && bytes[i] == b'.' {
        let path_start = i;
        while i < bytes.len() && bytes[i] != b'}' {
            i += 1;
        }
        path = Some(&template[path_start..i]);
    }

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i + 2 == bytes.len() && bytes[i] == b'}' && bytes[i + 1] == b'}' {
        Some((key, path))
    } else {
        None
    }
}

/// Substitute every embedded `{{<family><key>[.path]}}` occurrence (exact
/// form, no interior whitespace) using `lookup`, coercing each value to its
/// string form.
fn replace_partial(
    template: &str,
    family: &str,
    allow_path: bool,
    mut lookup: impl FnMut(&str, Option<&str>) -> Result<Value, TemplateError>,
) -> Result<String, TemplateError> {
    let bytes = template.as_bytes();
    let open = format!("{{{{{family}");
    let mut result = String::with_capacity(template.len());
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i..].starts_with(open.as_bytes()) {
            // Copy a full UTF-8 character, not a byte.
            let ch_len = template[i..].chars().next().map_or(1, char::len_utf8);
            result.push_str(&template[i..i + ch_len]);
            i += ch_len;
            continue;
        }

        let mut j = i + open.len();
        let key_start = j;
        while j < bytes.len() && is_key_byte(bytes[j]) {
            j += 1;
        }
        if j == key_start {
            result.push_str("{{");
            i += 2;
            continue;
        }
        let key = &template[key_start..j];

        let mut path = None;
        if allow_path && j < bytes.len() && bytes[j] == b'.' {
            let path_start = j;
            while j < bytes.len() && bytes[j] != b'}' {
                j += 1;
            }
            path = Some(&template[path_start..j]);
        }

        if j + 1 < bytes.len() && bytes[j] == b'}' && bytes[j + 1] == b'}' {
            let value = lookup(key, path)?;
            result.push_str(&coerce_interpolated(&value));
            i = j + 2;
        } else {
            result.push_str("{{");
            i += 2;
        }
    }

    Ok(result)
}

fn push_unique(refs: &mut Vec<String>, key: &str) {
    if !refs.iter().any(|existing| existing == key) {
        refs.push(key.to_string());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
