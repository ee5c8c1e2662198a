//! Query keys and their canonical form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A cache key, either a plain string or structured JSON.
///
/// Every key is normalized on construction:
/// - anything that is not an array is wrapped into a one-element array,
///   so `"todos"` and `["todos"]` address the same entry;
/// - object members are ordered by key at every depth.
///
/// Equality, hashing and ordering use only the canonical string.
#[derive(Clone)]
pub struct QueryKey {
    canonical: String,
    parts: Value,
}

impl QueryKey {
    pub fn new(value: impl Into<Value>) -> Self {
        let parts = match canonicalize(value.into()) {
            Value::Array(items) => Value::Array(items),
            other => Value::Array(vec![other]),
        };
        let canonical = parts.to_string();
        Self { canonical, parts }
    }

    /// Canonical JSON string used for identity.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// The normalized structured key (always an array).
    pub fn parts(&self) -> &Value {
        &self.parts
    }

    /// First element of the key, when it is a string.
    pub fn head(&self) -> Option<&str> {
        self.parts.get(0).and_then(Value::as_str)
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(members) => {
            let mut sorted: Vec<(String, Value)> = members.into_iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        scalar => scalar,
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryKey").field(&self.canonical).finish()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(value: &QueryKey) -> Self {
        value.clone()
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}
