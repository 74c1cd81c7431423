//! Block Spec: the declarative descriptor loaded from disk for each Block.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Does `value` conform to this declared type? Used by the Runner for
    /// shape checks at node boundaries (§4.7.2) and by the Dry-run Engine
    /// to synthesize a minimal value per type (§4.6).
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array, Value::Array(_)) => true,
            (FieldType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }

    /// A minimal value of this type, used when no `dry_run.samples` entry
    /// is declared for an output (§4.6).
    pub fn minimal_sample(&self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Number => Value::Number(0.into()),
            FieldType::Integer => Value::Number(0.into()),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Array => Value::Array(Vec::new()),
            FieldType::Object => Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    #[serde(rename = "enum", default)]
    pub enum_values: Vec<Value>,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunSpec {
    /// Example outputs, keyed by output name, preferred over a synthesized
    /// minimal value when present.
    #[serde(default)]
    pub samples: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSpec {
    pub id: String,
    pub version: String,
    pub entrypoint: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FieldSchema>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub dry_run: DryRunSpec,
}

impl BlockSpec {
    pub fn from_str(text: &str) -> Result<Self, crate::errors::RunnerError> {
        serde_yaml::from_str(text).map_err(|e| crate::errors::RunnerError::SpecParseError(e.to_string()))
    }

    /// `id@version`, the identity used for duplicate detection (§4.1).
    pub fn qualified_id(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }
}
