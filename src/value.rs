//! Dynamic value model shared by the Plan format, Block I/O, the Reference
//! Resolver, and the Expression Evaluator.
//!
//! Block inputs/outputs are untyped maps checked at runtime against the
//! declarative schemas in [`crate::registry::spec`]. Rather than juggle
//! `serde_json::Value` directly throughout the crate (and inherit its
//! JSON-only vocabulary), we define our own sum type so that YAML-only
//! constructs (e.g. a `null` vs. an absent key) and base64 byte payloads have
//! a single, unambiguous home.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

/// The dynamic value type used for Plan variables, Block inputs/outputs, and
/// everything the Reference Resolver and Expression Evaluator touch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Truthiness used by the guard grammar: `null`, `false`, empty string,
    /// empty array/object, and numeric zero are falsy; everything else is
    /// truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    /// Iterate over an "iterable" value, as required by `foreach.input`: a
    /// sequence iterates its elements, a map iterates its values in key
    /// order (`BTreeMap` is already sorted).
    pub fn iter_elements(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.clone()),
            Value::Object(map) => Some(map.values().cloned().collect()),
            _ => None,
        }
    }

    /// Look up a single path segment: an object key or an array index.
    pub fn get_path_segment(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(segment).or_else(|| {
                // Case-insensitive fallback, per the Reference Resolver spec.
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(segment))
                    .map(|(_, v)| v)
            }),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Does this value look like a binary file descriptor per §4.8 —
    /// `{name, bytes}` or `{name, base64}`?
    pub fn as_binary_descriptor(&self) -> Option<(&str, Vec<u8>)> {
        let map = self.as_object()?;
        let name = map.get("name")?.as_str()?;
        if let Some(Value::String(b64)) = map.get("base64") {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64).ok()?;
            return Some((name, bytes));
        }
        if let Some(Value::Array(items)) = map.get("bytes") {
            let bytes = items
                .iter()
                .map(|v| v.as_i64().map(|n| n as u8))
                .collect::<Option<Vec<u8>>>()?;
            return Some((name, bytes));
        }
        None
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(_) | Value::Object(_) => {
                write!(f, "{}", serde_json::to_string(&self.to_json()).unwrap_or_default())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Value {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        arbitrary_value(g, 3)
    }
}

#[cfg(test)]
fn arbitrary_value(g: &mut quickcheck::Gen, depth: u32) -> Value {
    use quickcheck::Arbitrary;

    // Bias toward scalars as depth runs out, so generation terminates.
    let choice = if depth == 0 { u8::arbitrary(g) % 4 } else { u8::arbitrary(g) % 6 };
    match choice {
        0 => Value::Null,
        1 => Value::Bool(bool::arbitrary(g)),
        2 => Value::Number(i64::arbitrary(g).into()),
        3 => Value::String(String::arbitrary(g)),
        4 => Value::Array(
            (0..(u8::arbitrary(g) % 3))
                .map(|_| arbitrary_value(g, depth - 1))
                .collect(),
        ),
        _ => Value::Object(
            (0..(u8::arbitrary(g) % 3))
                .map(|_| (String::arbitrary(g), arbitrary_value(g, depth - 1)))
                .collect(),
        ),
    }
}
