//! Byte-bounded wrapping of JSON written to run and step-run rows.
//!
//! Everything the engine persists (step outputs, resolved-request snapshots,
//! failure detail) goes through [`wrap_for_db`]. Values over the hard ceiling
//! are rejected. Values over the soft budget are progressively degraded:
//! first a depth cap alone, then depth plus array/key/string caps, and as a
//! last resort the whole value is stringified and cut at a byte boundary.
//! The stored shape is always an envelope carrying a [`PersistMeta`], so
//! readers can tell a truncated payload from a complete one.

use runloom_types::envelope::{self, PersistMeta};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hard ceiling for any persisted payload.
pub const HARD_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Marker replacing nodes beyond the depth cap.
const DEPTH_MARKER: &str = "[Truncated: maxDepth]";

/// Suffix appended to strings cut by a length or byte cap.
const TRUNCATION_SUFFIX: &str = "...[truncated]";

/// Count of dropped keys, recorded on objects that lost keys to a cap.
const TRUNCATED_KEYS_KEY: &str = "_truncatedKeys";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("{reason}: payload of {bytes} bytes exceeds hard limit of {hard_max_bytes} bytes")]
    PayloadTooLarge {
        reason: String,
        bytes: usize,
        hard_max_bytes: usize,
    },
}

/// Size policy for one persisted value.
#[derive(Debug, Clone)]
pub struct PersistPolicy {
    /// Soft budget; degradation kicks in above this.
    pub max_bytes: usize,
    /// When false the value is stored as-is up to the hard ceiling.
    pub truncate: bool,
    pub hard_max_bytes: usize,
    /// What is being persisted (`step_output`, `step_input`, `step_error`).
    pub reason: String,
}

impl PersistPolicy {
    pub fn new(max_bytes: usize, truncate: bool, reason: impl Into<String>) -> Self {
        PersistPolicy {
            max_bytes,
            truncate,
            hard_max_bytes: HARD_MAX_BYTES,
            reason: reason.into(),
        }
    }
}

/// Serialized size of a value, in bytes.
pub fn estimate_bytes(value: &Value) -> usize {
    serde_json::to_string(value)
        .map(|s| s.len())
        .unwrap_or_default()
}

/// Wrap `value` in a persistence envelope, degrading it to fit the policy.
///
/// Fails only when the original value breaches the hard ceiling; everything
/// else is made to fit and flagged via the envelope meta.
pub fn wrap_for_db(value: &Value, policy: &PersistPolicy) -> Result<Value, PersistError> {
    let bytes = estimate_bytes(value);

    if bytes > policy.hard_max_bytes {
        return Err(PersistError::PayloadTooLarge {
            reason: policy.reason.clone(),
            bytes,
            hard_max_bytes: policy.hard_max_bytes,
        });
    }

    if !policy.truncate || bytes <= policy.max_bytes {
        let meta = PersistMeta {
            truncated: false,
            bytes_estimate: bytes,
            original_bytes_estimate: None,
            max_bytes: policy.max_bytes,
            hard_max_bytes: policy.hard_max_bytes,
            reason: Some(policy.reason.clone()),
        };
        return Ok(envelope::wrap(&meta, value.clone()));
    }

    let truncated = truncate_json(value, policy.max_bytes);
    let truncated_bytes = estimate_bytes(&truncated);
    tracing::warn!(
        reason = policy.reason.as_str(),
        original_bytes = bytes,
        stored_bytes = truncated_bytes,
        max_bytes = policy.max_bytes,
        "persisted payload truncated"
    );

    let meta = PersistMeta {
        truncated: true,
        bytes_estimate: truncated_bytes,
        original_bytes_estimate: Some(bytes),
        max_bytes: policy.max_bytes,
        hard_max_bytes: policy.hard_max_bytes,
        reason: Some(policy.reason.clone()),
    };
    Ok(envelope::wrap(&meta, truncated))
}

// ---------------------------------------------------------------------------
// Degradation ladder
// ---------------------------------------------------------------------------

struct SimplifyCaps {
    array: usize,
    keys: usize,
    string: usize,
}

/// Degrade `value` until it serializes within `max_bytes`.
fn truncate_json(value: &Value, max_bytes: usize) -> Value {
    const PASSES: [(usize, Option<SimplifyCaps>); 3] = [
        (20, None),
        (
            8,
            Some(SimplifyCaps {
                array: 50,
                keys: 50,
                string: 2000,
            }),
        ),
        (
            6,
            Some(SimplifyCaps {
                array: 10,
                keys: 10,
                string: 500,
            }),
        ),
    ];

    for (max_depth, caps) in &PASSES {
        let candidate = simplify(value, 0, *max_depth, caps.as_ref());
        if estimate_bytes(&candidate) <= max_bytes {
            return candidate;
        }
    }

    // Structural degradation was not enough; stringify and cut by bytes.
    let serialized = value.to_string();
    Value::String(truncate_string_bytes(&serialized, max_bytes))
}

fn simplify(node: &Value, depth: usize, max_depth: usize, caps: Option<&SimplifyCaps>) -> Value {
    if node.is_null() {
        return Value::Null;
    }
    if depth >= max_depth {
        return Value::String(DEPTH_MARKER.to_string());
    }

    match node {
        Value::String(text) => match caps {
            Some(caps) if text.chars().count() > caps.string => {
                Value::String(truncate_string_chars(text, caps.string))
            }
            _ => node.clone(),
        },
        Value::Array(items) => {
            let take = caps.map(|c| c.array.min(items.len())).unwrap_or(items.len());
            Value::Array(
                items[..take]
                    .iter()
                    .map(|item| simplify(item, depth + 1, max_depth, caps))
                    .collect(),
            )
        }
        Value::Object(map) => {
            let take = caps.map(|c| c.keys.min(map.len())).unwrap_or(map.len());
            let mut out = Map::new();
            for (key, value) in map.iter().take(take) {
                out.insert(key.clone(), simplify(value, depth + 1, max_depth, caps));
            }
            if take < map.len() {
                out.insert(
                    TRUNCATED_KEYS_KEY.to_string(),
                    Value::from(map.len() - take),
                );
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Cut a string to at most `max_chars` characters and mark the cut.
fn truncate_string_chars(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Cut a string so its JSON serialization (marker and escapes included)
/// stays within `max_bytes`, never splitting a UTF-8 character.
fn truncate_string_bytes(text: &str, max_bytes: usize) -> String {
    if serialized_len(text) <= max_bytes {
        return text.to_string();
    }

    // Escaping can expand one character to six serialized bytes, so the cut
    // point is found by measuring candidates, not by byte arithmetic.
    let fits = |end: usize| serialized_len(&format!("{}{}", &text[..end], TRUNCATION_SUFFIX)) <= max_bytes;

    let mut lo = 0;
    let mut hi = text.len();
    while hi - lo > 1 {
        let mut mid = lo + (hi - lo) / 2;
        while mid > lo && !text.is_char_boundary(mid) {
            mid -= 1;
        }
        if mid == lo {
            break;
        }
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    format!("{}{}", &text[..lo], TRUNCATION_SUFFIX)
}

/// Serialized size of a bare string, quotes and escapes included.
fn serialized_len(text: &str) -> usize {
    serde_json::to_string(text).map(|s| s.len()).unwrap_or_default()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(max_bytes: usize, truncate: bool) -> PersistPolicy {
        PersistPolicy::new(max_bytes, truncate, "step_output")
    }

    fn meta(wrapped: &Value) -> PersistMeta {
        serde_json::from_value(wrapped["_meta"].clone()).unwrap()
    }

    #[test]
    fn test_small_value_passes_through_untruncated() {
        let value = json!({ "ok": true, "count": 3 });
        let wrapped = wrap_for_db(&value, &policy(1024, true)).unwrap();

        assert_eq!(wrapped["data"], value);
        let meta = meta(&wrapped);
        assert!(!meta.truncated);
        assert_eq!(meta.bytes_estimate, estimate_bytes(&value));
        assert_eq!(meta.reason.as_deref(), Some("step_output"));
    }

    #[test]
    fn test_hard_limit_rejects() {
        let big = json!({ "blob": "x".repeat(128) });
        let mut p = policy(64, true);
        p.hard_max_bytes = 100;

        let err = wrap_for_db(&big, &p).unwrap_err();
        let PersistError::PayloadTooLarge {
            bytes,
            hard_max_bytes,
            ..
        } = err;
        assert!(bytes > 100);
        assert_eq!(hard_max_bytes, 100);
    }

    #[test]
    fn test_truncate_disabled_stores_oversized_as_is() {
        let big = json!({ "blob": "x".repeat(256) });
        let wrapped = wrap_for_db(&big, &policy(64, false)).unwrap();

        assert_eq!(wrapped["data"], big);
        assert!(!meta(&wrapped).truncated);
    }

    #[test]
    fn test_depth_cap_inserts_marker() {
        // 25 levels of nesting; within byte budget only after depth capping.
        let mut value = json!("leaf");
        for _ in 0..25 {
            value = json!({ "n": value });
        }
        let wrapped = wrap_for_db(&value, &policy(200, true)).unwrap();

        let serialized = wrapped["data"].to_string();
        assert!(serialized.contains(DEPTH_MARKER));
        assert!(meta(&wrapped).truncated);
    }

    #[test]
    fn test_array_and_key_caps_apply() {
        let items: Vec<Value> = (0..200).map(|i| json!(format!("item-{i}"))).collect();
        let value = json!({ "items": items });
        let wrapped = wrap_for_db(&value, &policy(700, true)).unwrap();

        let stored = wrapped["data"]["items"].as_array().unwrap();
        assert!(stored.len() <= 50);
        assert!(meta(&wrapped).truncated);
        assert!(estimate_bytes(&wrapped["data"]) <= 700);
    }

    #[test]
    fn test_truncated_keys_count_recorded() {
        let mut map = Map::new();
        for i in 0..120 {
            map.insert(format!("key_number_{i:04}"), json!(i));
        }
        let value = Value::Object(map);
        let wrapped = wrap_for_db(&value, &policy(1200, true)).unwrap();

        let stored = wrapped["data"].as_object().unwrap();
        let dropped = stored[TRUNCATED_KEYS_KEY].as_u64().unwrap();
        assert_eq!(dropped as usize, 120 - (stored.len() - 1));
    }

    #[test]
    fn test_stringify_fallback_respects_byte_budget() {
        // A single long string defeats structural caps at depth 0.
        let value = json!("y".repeat(5000));
        let wrapped = wrap_for_db(&value, &policy(600, true)).unwrap();

        let stored = wrapped["data"].as_str().unwrap();
        assert!(stored.ends_with(TRUNCATION_SUFFIX));
        assert!(estimate_bytes(&wrapped["data"]) <= 600);
    }

    #[test]
    fn test_byte_cut_accounts_for_escape_expansion() {
        // Every character serializes as two bytes (\"), so a raw-byte budget
        // would overshoot; the stored form must fit after escaping.
        let value = json!("\"".repeat(5000));
        let wrapped = wrap_for_db(&value, &policy(600, true)).unwrap();

        let stored = wrapped["data"].as_str().unwrap();
        assert!(stored.ends_with(TRUNCATION_SUFFIX));
        assert!(estimate_bytes(&wrapped["data"]) <= 600);
    }

    #[test]
    fn test_byte_cut_respects_char_boundaries() {
        let cut = truncate_string_bytes(&"é".repeat(300), 100);
        assert!(cut.ends_with(TRUNCATION_SUFFIX));
        assert!(cut.len() <= 100);
    }

    #[test]
    fn test_original_bytes_recorded_when_truncated() {
        let value = json!({ "blob": "z".repeat(2048) });
        let original = estimate_bytes(&value);
        let wrapped = wrap_for_db(&value, &policy(256, true)).unwrap();

        let meta = meta(&wrapped);
        assert!(meta.truncated);
        assert_eq!(meta.original_bytes_estimate, Some(original));
        assert_eq!(meta.max_bytes, 256);
    }
}
