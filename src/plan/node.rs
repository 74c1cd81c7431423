//! Node definitions: the three node kinds a Plan's `graph` may contain.
//!
//! The on-disk format (§6) distinguishes kinds structurally rather than with
//! a single clean discriminant: a Block node is identified by the presence
//! of `block`, a Loop node by `type: loop` plus `foreach`/`while`, a Subflow
//! node by `type: subflow` plus `call`. We deserialize into a permissive
//! [`RawNode`] first and then validate/narrow into [`Node`], the same
//! "deserialize loose, then convert" shape the teacher's `PlanStep` uses for
//! its `#[serde(alias = "intent")]` back-compat field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A single node within a Plan's graph.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize)]
pub enum NodeKind {
    Block(BlockNode),
    Loop(LoopNode),
    Subflow(SubflowNode),
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockNode {
    pub block_id: String,
    pub block_version: Option<String>,
    #[serde(rename = "in")]
    pub inputs: BTreeMap<String, Value>,
    /// Block output name -> alias used by downstream references.
    pub out: BTreeMap<String, String>,
    pub when: Option<Guard>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopNode {
    pub spec: LoopSpec,
    pub body: BodyPlan,
    /// `out.collect`: the body-local alias to aggregate into a sequence.
    /// Optional for `while` nodes (Open Question, resolved in DESIGN.md);
    /// required for `foreach`.
    pub collect: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum LoopSpec {
    Foreach(ForeachSpec),
    While(WhileSpec),
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeachSpec {
    pub input: Value,
    pub item_var: String,
    pub index_var: Option<String>,
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhileSpec {
    pub condition: Guard,
    pub max_iterations: u64,
}

/// The nested body Plan of a Loop node: its own sub-graph plus a list of
/// local-alias -> exported-name mappings evaluated after each iteration.
#[derive(Debug, Clone, Serialize)]
pub struct BodyPlan {
    pub graph: Vec<Node>,
    pub exports: Vec<ExportSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSpec {
    pub from: String,
    #[serde(rename = "as")]
    pub as_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubflowNode {
    pub plan_id: String,
    pub inputs: BTreeMap<String, Value>,
    pub exports: Vec<ExportSpec>,
}

/// A `when`/`while.condition` guard: either a raw expression string (parsed
/// by the Expression Evaluator, §4.3) or a structured `{left, op, right}`
/// comparison treated identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Guard {
    Expr { expr: String },
    Structured {
        left: Value,
        op: CompareOp,
        right: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

// ---- Deserialization: raw permissive shape -> validated Node ----

#[derive(Debug, Deserialize)]
struct RawForeach {
    input: Value,
    item_var: String,
    index_var: Option<String>,
    max_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawWhile {
    condition: Guard,
    max_iterations: u64,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    plan: RawBodyPlan,
}

#[derive(Debug, Deserialize)]
struct RawBodyPlan {
    graph: Vec<Node>,
    #[serde(default)]
    exports: Vec<ExportSpec>,
}

#[derive(Debug, Deserialize)]
struct RawCall {
    plan_id: String,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawOut {
    #[serde(default)]
    collect: Option<String>,
    #[serde(default)]
    exports: Vec<ExportSpec>,
    /// Block-node alias map (`{block_output: alias}`); present only when
    /// `collect`/`exports` are absent.
    #[serde(flatten)]
    aliases: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default, rename = "type")]
    node_type: Option<String>,
    // block node fields
    block: Option<String>,
    #[serde(default, rename = "in")]
    inputs: BTreeMap<String, Value>,
    when: Option<Guard>,
    // loop node fields
    foreach: Option<RawForeach>,
    #[serde(rename = "while")]
    while_spec: Option<RawWhile>,
    body: Option<RawBody>,
    // subflow node fields
    call: Option<RawCall>,
    #[serde(default)]
    out: Option<RawOut>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, String> {
        let id = raw.id.clone();
        let node_type = raw.node_type.as_deref();

        if let Some(block) = raw.block {
            let (block_id, block_version) = match block.split_once('@') {
                Some((b, v)) => (b.to_string(), Some(v.to_string())),
                None => (block, None),
            };
            let out = raw.out.map(|o| o.aliases).unwrap_or_default();
            return Ok(Node {
                id,
                kind: NodeKind::Block(BlockNode {
                    block_id,
                    block_version,
                    inputs: raw.inputs,
                    out,
                    when: raw.when,
                }),
            });
        }

        if node_type == Some("loop") || raw.foreach.is_some() || raw.while_spec.is_some() {
            let spec = match (raw.foreach, raw.while_spec) {
                (Some(f), None) => LoopSpec::Foreach(ForeachSpec {
                    input: f.input,
                    item_var: f.item_var,
                    index_var: f.index_var,
                    max_concurrency: f.max_concurrency,
                }),
                (None, Some(w)) => LoopSpec::While(WhileSpec {
                    condition: w.condition,
                    max_iterations: w.max_iterations,
                }),
                (Some(_), Some(_)) => {
                    return Err(format!("node `{id}` declares both foreach and while"));
                }
                (None, None) => {
                    return Err(format!("node `{id}` is type=loop but has no foreach/while"));
                }
            };
            let body = raw
                .body
                .ok_or_else(|| format!("loop node `{id}` missing body"))?;
            let out = raw.out.unwrap_or(RawOut {
                collect: None,
                exports: Vec::new(),
                aliases: BTreeMap::new(),
            });
            return Ok(Node {
                id,
                kind: NodeKind::Loop(LoopNode {
                    spec,
                    body: BodyPlan {
                        graph: body.plan.graph,
                        exports: body.plan.exports,
                    },
                    collect: out.collect,
                }),
            });
        }

        if node_type == Some("subflow") || raw.call.is_some() {
            let call = raw
                .call
                .ok_or_else(|| format!("subflow node `{id}` missing call"))?;
            let out = raw.out.unwrap_or(RawOut {
                collect: None,
                exports: Vec::new(),
                aliases: BTreeMap::new(),
            });
            return Ok(Node {
                id,
                kind: NodeKind::Subflow(SubflowNode {
                    plan_id: call.plan_id,
                    inputs: call.inputs,
                    exports: out.exports,
                }),
            });
        }

        Err(format!(
            "node `{id}` is neither a block node (`block`), a loop node (`type: loop`), nor a subflow node (`type: subflow`)"
        ))
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawNode::deserialize(deserializer)?;
        Node::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl Node {
    /// `true` for Block nodes only — the scheduler places Loop/Subflow
    /// nodes in the same bounded pool as Processing blocks (their bodies
    /// recurse into their own schedulers), but only Block nodes can carry
    /// the UI/Processing distinction.
    pub fn is_block(&self) -> bool {
        matches!(self.kind, NodeKind::Block(_))
    }
}
