//! Secret scrubbing for persisted and logged JSON.
//!
//! Two mechanisms, applied together and both idempotent:
//!
//! - key-pattern redaction: any object key that looks sensitive (webhook,
//!   token, secret, password, api key, authorization) has its value replaced
//!   wholesale, at any depth;
//! - literal-value redaction: every occurrence of a known secret value inside
//!   any string is replaced, longest value first so overlapping secrets
//!   cannot leave fragments behind.

use serde_json::{Map, Value};

/// Replacement marker for redacted content.
pub const REDACTED: &str = "[REDACTED]";

/// Lowercase fragments that mark an object key as sensitive.
const SENSITIVE_KEY_PARTS: &[&str] = &[
    "webhook",
    "token",
    "secret",
    "password",
    "api_key",
    "api-key",
    "apikey",
    "authorization",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lower.contains(part))
}

/// Redact `value`, replacing sensitive-keyed fields and every literal
/// occurrence of the given secret values.
pub fn redact_secrets(value: &Value, secret_values: &[String]) -> Value {
    // Longest first so a secret that contains another is consumed whole.
    let mut needles: Vec<&str> = secret_values
        .iter()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .collect();
    needles.sort_by_key(|s| std::cmp::Reverse(s.len()));

    redact_inner(value, &needles)
}

fn redact_inner(value: &Value, needles: &[&str]) -> Value {
    match value {
        Value::String(text) => Value::String(redact_string(text, needles)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| redact_inner(item, needles)).collect())
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_inner(val, needles));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn redact_string(text: &str, needles: &[&str]) -> String {
    let mut out = text.to_string();
    for needle in needles {
        if out.contains(needle) {
            out = out.replace(needle, REDACTED);
        }
    }
    out
}

// ===========================================================================
// Tests
// ===========================================================================
