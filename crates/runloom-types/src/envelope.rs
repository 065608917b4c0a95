//! Bookkeeping envelopes around persisted and executor-produced JSON.
//!
//! Two producers share one wire shape, `{"_meta": {...}, "data": <value>}`:
//! the persistence policy wraps anything written to run/step-run rows with a
//! [`PersistMeta`], and the HTTP executor wraps response bodies with an
//! [`HttpBodyMeta`]. Template resolution strips envelopes before exposing
//! values, so workflow authors never see the bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker key identifying an envelope object.
pub const META_KEY: &str = "_meta";

/// Key carrying the wrapped value inside an envelope.
pub const DATA_KEY: &str = "data";

// ---------------------------------------------------------------------------
// Meta payloads
// ---------------------------------------------------------------------------

/// Size bookkeeping attached to a persisted JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistMeta {
    pub truncated: bool,
    /// Serialized size of the stored `data`.
    pub bytes_estimate: usize,
    /// Pre-truncation size, recorded only when `truncated` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_bytes_estimate: Option<usize>,
    pub max_bytes: usize,
    pub hard_max_bytes: usize,
    /// What was being persisted (`step_output`, `step_input`, `step_error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Read bookkeeping attached to an HTTP response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpBodyMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub truncated: bool,
    /// Bytes actually read off the wire before the stream was dropped.
    pub bytes_read: usize,
    pub soft_max_bytes: usize,
    pub hard_max_bytes: usize,
}

// ---------------------------------------------------------------------------
// Envelope helpers
// ---------------------------------------------------------------------------

/// Wrap `data` in an envelope carrying `meta`.
pub fn wrap<M: Serialize>(meta: &M, data: Value) -> Value {
    let mut map = Map::new();
    map.insert(
        META_KEY.to_string(),
        serde_json::to_value(meta).unwrap_or(Value::Null),
    );
    map.insert(DATA_KEY.to_string(), data);
    Value::Object(map)
}

/// True when `value` has the envelope shape (an object carrying both the
/// `_meta` and `data` keys).
pub fn is_envelope(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key(META_KEY) && map.contains_key(DATA_KEY),
        _ => false,
    }
}

/// One positional unwrap: the envelope's `data` when `value` is an envelope,
/// otherwise `value` itself.
pub fn unwrap_data(value: &Value) -> &Value {
    if let Value::Object(map) = value {
        if map.contains_key(META_KEY) {
            if let Some(data) = map.get(DATA_KEY) {
                return data;
            }
        }
    }
    value
}

/// The envelope's meta object, when present.
pub fn envelope_meta(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if map.contains_key(DATA_KEY) => map.get(META_KEY),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
