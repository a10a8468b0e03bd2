//! Protocol message model.
//!
//! Every protocol message is a string-keyed map with an `"op"` discriminator,
//! carried on the wire as MessagePack. [`Msg`] wraps the decoded map with
//! typed field accessors; frames that are not maps (bare `"OK"` replies, key
//! arrays) stay plain [`Value`]s.

pub mod codec;

use rmpv::Value;

/// Opaque key identifying a task or a piece of data.
pub type Key = String;

/// A string-keyed protocol message.
///
/// Entries preserve insertion order so encoded messages are stable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Msg {
    entries: Vec<(String, Value)>,
}

impl Msg {
    /// Create a message with the given `"op"` discriminator.
    pub fn new(op: &str) -> Self {
        Self { entries: vec![("op".to_string(), Value::from(op))] }
    }

    /// Create an empty message with no fields.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value.into());
        self
    }

    /// Insert a field, replacing any previous value under the same key.
    pub fn insert(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove and return a field.
    pub fn take(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// The `"op"` discriminator, if present.
    pub fn op(&self) -> Option<&str> {
        self.str_field("op")
    }

    /// A field as text. Binary fields holding UTF-8 also qualify.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::String(s) => s.as_str(),
            Value::Binary(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// A field as raw bytes (binary or string payload).
    pub fn bytes_field(&self, key: &str) -> Option<&[u8]> {
        self.get(key)?.as_slice()
    }

    /// A boolean field, with a default when absent or mistyped.
    pub fn bool_field(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// An integer field.
    pub fn int_field(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_i64()
    }

    /// An array-of-keys field; string and binary elements both decode as text.
    pub fn keys_field(&self, key: &str) -> Vec<Key> {
        let Some(Value::Array(items)) = self.get(key) else {
            return Vec::new();
        };
        items.iter().filter_map(value_as_text).collect()
    }

    /// A map-valued field.
    pub fn map_field(&self, key: &str) -> Option<&Vec<(Value, Value)>> {
        self.get(key)?.as_map()
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the message has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert into the wire value.
    pub fn into_value(self) -> Value {
        Value::Map(
            self.entries
                .into_iter()
                .map(|(k, v)| (Value::from(k), v))
                .collect(),
        )
    }

    /// Interpret a decoded wire value as a message.
    ///
    /// Returns `None` for non-map values and for maps with non-text keys.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Map(pairs) = value else {
            return None;
        };
        let mut entries = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            entries.push((value_as_text(&k)?, v));
        }
        Some(Self { entries })
    }
}

impl From<Msg> for Value {
    fn from(msg: Msg) -> Self {
        msg.into_value()
    }
}

/// Read a value as text, accepting UTF-8 binary.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => s.as_str().map(str::to_string),
        Value::Binary(b) => std::str::from_utf8(b).ok().map(str::to_string),
        _ => None,
    }
}

/// Build an array value from keys.
pub fn keys_value<S: AsRef<str>>(keys: impl IntoIterator<Item = S>) -> Value {
    Value::Array(keys.into_iter().map(|k| Value::from(k.as_ref())).collect())
}

/// Estimated serialized size of a value, in bytes.
pub fn value_nbytes(value: &Value) -> usize {
    let mut buf = Vec::new();
    // Encoding into a Vec cannot fail for well-formed values.
    if rmpv::encode::write_value(&mut buf, value).is_err() {
        return 0;
    }
    buf.len()
}
