//! The Plan document: a declarative DAG of Nodes plus policy and UI hints.
//!
//! A Plan is identified by `(plan_id, version)` plus an `api_version` tag
//! (§3). It is accepted in either YAML or JSON — both parse onto this same
//! model, since JSON is a syntactic subset of YAML 1.2 and `serde_yaml`
//! handles both without a dedicated JSON code path (§10.2).

pub mod node;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::RunnerError;
use crate::value::Value;
use node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    Halt,
    Continue,
    Retry,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Halt
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    #[serde(default = "default_max_workers")]
    pub default_max_workers: usize,
}

fn default_max_workers() -> usize {
    4
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            default_max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retries: u32,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiLayout {
    #[serde(default)]
    pub layout: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub api_version: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub ui: UiLayout,
    pub graph: Vec<Node>,
}

impl Plan {
    /// Parse a Plan document from YAML or JSON text.
    pub fn from_str(text: &str) -> Result<Self, RunnerError> {
        serde_yaml::from_str(text).map_err(|e| RunnerError::PlanParseError(e.to_string()))
    }

    /// Load a Plan document from disk.
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.graph.iter().find(|n| n.id == node_id)
    }

    /// Index of `node_id` within `ui.layout`, used to stable-sort the ready
    /// set (§4.7.2 step 2).
    pub fn ui_layout_index(&self, node_id: &str) -> Option<usize> {
        self.ui.layout.iter().position(|id| id == node_id)
    }

    pub fn is_ui_node(&self, node_id: &str) -> bool {
        self.ui_layout_index(node_id).is_some()
    }
}
