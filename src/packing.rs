//! Placeholder substitution inside structured arguments.
//!
//! Task arguments arrive as structured values whose leaves may name data
//! keys. [`pack_data`] swaps those placeholders for the in-memory values
//! right before execution; [`unpack_data`] is its inverse.

use std::collections::HashMap;

use rmpv::Value;

use crate::proto::Key;

/// Replace every leaf that names a key of `data` with the stored value.
///
/// Recurses through arrays and map values; map keys are left alone.
pub fn pack_data(value: &Value, data: &HashMap<Key, Value>) -> Value {
    if let Some(key) = leaf_key(value) {
        if let Some(stored) = data.get(key) {
            return stored.clone();
        }
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| pack_data(v, data)).collect()),
        Value::Map(pairs) => Value::Map(
            pairs
                .iter()
                .map(|(k, v)| (k.clone(), pack_data(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace every subtree equal to a stored value with its key.
pub fn unpack_data(value: &Value, data: &HashMap<Key, Value>) -> Value {
    for (key, stored) in data {
        if value == stored {
            return Value::from(key.as_str());
        }
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(|v| unpack_data(v, data)).collect()),
        Value::Map(pairs) => Value::Map(
            pairs
                .iter()
                .map(|(k, v)| (k.clone(), unpack_data(v, data)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn leaf_key(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.as_str(),
        Value::Binary(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}
