//! Log sanitizing for descriptor payloads
//!
//! Embedding vectors run to hundreds of floats; logging them verbatim buries
//! everything else. `sanitize_for_logs` collapses long arrays to a length tag.

use serde_json::Value;

/// Arrays longer than this are replaced by `"<vector len=N>"`
pub const MAX_LOGGED_ARRAY_LEN: usize = 50;

/// Return a copy of `value` with long arrays collapsed
pub fn sanitize_for_logs(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > MAX_LOGGED_ARRAY_LEN => {
            Value::String(format!("<vector len={}>", items.len()))
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_for_logs).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_for_logs(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
