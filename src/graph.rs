//! Dependency Graph Builder (§4.4).
//!
//! Scans every value under a node's `in`, `when`, `foreach`/`while`, and
//! `subflow.call.inputs` for `${node.alias[…]}` placeholders and records an
//! edge `consumer -> producer` for each one found. `vars`/`env`/`config`
//! references never produce edges. The resulting adjacency list feeds the
//! Validator's cycle check (§4.5.4) and the Runner's ready-node discovery
//! (§4.7.2).
//!
//! Operates on a single graph *level* at a time — the top-level Plan's
//! `graph`, or a Loop node's nested body `graph` — since a body's internal
//! references never cross into the parent's node ids (§4.7.5 scope
//! isolation extends naturally to loop bodies: `vars.<item_var>` is how a
//! body reaches outside data, not a direct node reference).

use std::collections::{BTreeMap, BTreeSet};

use crate::plan::node::{Guard, LoopSpec, Node, NodeKind};
use crate::reference;
use crate::value::Value;

/// Adjacency list of a single graph level: `consumer -> {producers}`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub edges: BTreeMap<String, BTreeSet<String>>,
    pub node_ids: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn build(nodes: &[Node]) -> Self {
        let node_ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for node in nodes {
            let deps = dependencies_of(node, &node_ids);
            edges.insert(node.id.clone(), deps);
        }
        Self { edges, node_ids }
    }

    pub fn dependencies_of(&self, node_id: &str) -> BTreeSet<String> {
        self.edges.get(node_id).cloned().unwrap_or_default()
    }

    /// Nodes with no unresolved dependencies within this level.
    pub fn roots(&self) -> BTreeSet<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Depth-first cycle detection. Returns the cycle's node ids (in
    /// discovery order) if one exists.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = self
            .node_ids
            .iter()
            .map(|id| (id.as_str(), Mark::Unvisited))
            .collect();
        let mut stack: Vec<String> = Vec::new();

        fn visit<'a>(
            id: &'a str,
            graph: &'a DependencyGraph,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|n| n == id).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(id.to_string());
                    return Some(cycle);
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            stack.push(id.to_string());
            if let Some(deps) = graph.edges.get(id) {
                for dep in deps {
                    if let Some(cycle) = visit(dep.as_str(), graph, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        for id in &self.node_ids {
            if let Some(cycle) = visit(id.as_str(), self, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Any topological order; used by the Dry-run Engine (§4.6), which
    /// needs a single deterministic pass rather than the Runner's
    /// readiness-driven scheduling.
    pub fn topo_order(&self) -> Option<Vec<String>> {
        if self.detect_cycle().is_some() {
            return None;
        }
        let mut remaining = self.edges.clone();
        let mut order = Vec::with_capacity(self.node_ids.len());
        let mut done: BTreeSet<String> = BTreeSet::new();
        while order.len() < self.node_ids.len() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(id, deps)| !done.contains(*id) && deps.iter().all(|d| done.contains(d)))
                .map(|(id, _)| id.clone())
                .collect();
            if ready.is_empty() {
                return None;
            }
            for id in ready {
                done.insert(id.clone());
                order.push(id.clone());
                remaining.remove(&id);
            }
        }
        Some(order)
    }
}

fn dependencies_of(node: &Node, known_ids: &BTreeSet<String>) -> BTreeSet<String> {
    let mut deps = BTreeSet::new();
    match &node.kind {
        NodeKind::Block(b) => {
            for v in b.inputs.values() {
                deps.extend(reference::node_refs_in(v, known_ids));
            }
            if let Some(guard) = &b.when {
                deps.extend(guard_refs(guard, known_ids));
            }
        }
        NodeKind::Loop(l) => {
            match &l.spec {
                LoopSpec::Foreach(f) => {
                    deps.extend(reference::node_refs_in(&f.input, known_ids));
                }
                LoopSpec::While(w) => {
                    deps.extend(guard_refs(&w.condition, known_ids));
                }
            }
            // Body-internal references stay scoped to the body's own graph
            // level; they are never edges in the parent graph.
        }
        NodeKind::Subflow(s) => {
            for v in s.inputs.values() {
                deps.extend(reference::node_refs_in(v, known_ids));
            }
        }
    }
    deps.remove(&node.id);
    deps
}

fn guard_refs(guard: &Guard, known_ids: &BTreeSet<String>) -> BTreeSet<String> {
    match guard {
        Guard::Expr { expr } => reference::node_refs_in(&Value::String(expr.clone()), known_ids),
        Guard::Structured { left, op: _, right } => {
            let mut s = reference::node_refs_in(left, known_ids);
            s.extend(reference::node_refs_in(right, known_ids));
            s
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_nodes(yaml: &str) -> Vec<Node> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            graph: Vec<Node>,
        }
        let w: Wrapper = serde_yaml::from_str(yaml).expect("parse");
        w.graph
    }

    #[test]
    fn edges_follow_placeholders_and_guards() {
        let nodes = parse_nodes(
            r#"
graph:
  - id: A
    block: constant
    in: { value: 7 }
    out: { value: v }
  - id: B
    block: double
    in: { x: "${A.v}" }
    out: { y: r }
    when: { expr: "${A.v} > 0" }
"#,
        );
        let graph = DependencyGraph::build(&nodes);
        assert_eq!(graph.dependencies_of("B"), BTreeSet::from(["A".to_string()]));
        assert!(graph.dependencies_of("A").is_empty());
        assert_eq!(graph.roots(), BTreeSet::from(["A".to_string()]));
    }

    #[test]
    fn detects_a_two_node_cycle() {
        let nodes = parse_nodes(
            r#"
graph:
  - id: A
    block: double
    in: { x: "${B.r}" }
    out: { y: v }
  - id: B
    block: double
    in: { x: "${A.v}" }
    out: { y: r }
"#,
        );
        let graph = DependencyGraph::build(&nodes);
        assert!(graph.detect_cycle().is_some());
        assert!(graph.topo_order().is_none());
    }

    #[test]
    fn topo_order_respects_edges() {
        let nodes = parse_nodes(
            r#"
graph:
  - id: A
    block: constant
    in: { value: 1 }
    out: { value: v }
  - id: B
    block: double
    in: { x: "${A.v}" }
    out: { y: r }
"#,
        );
        let graph = DependencyGraph::build(&nodes);
        let order = graph.topo_order().expect("acyclic");
        assert_eq!(order, vec!["A".to_string(), "B".to_string()]);
    }
}
