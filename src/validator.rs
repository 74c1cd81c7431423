//! Static Validator (§4.5): runs every check and aggregates messages
//! rather than failing at the first one, so `ValidationError` reports the
//! full set problems in one pass. Validation failures are never silently
//! recovered — callers must surface them (§4.5).

use std::collections::BTreeSet;

use crate::errors::RunnerError;
use crate::expr;
use crate::graph::DependencyGraph;
use crate::plan::node::{Guard, LoopSpec, Node, NodeKind};
use crate::plan::Plan;
use crate::reference;
use crate::registry::Registry;
use crate::value::Value;

/// Validate `plan` against `registry`. Collects every violated check (§4.5
/// items 1-8) into a single `ValidationError` rather than stopping at the
/// first problem.
pub fn validate(plan: &Plan, registry: &Registry) -> Result<(), RunnerError> {
    let mut messages = Vec::new();
    let known_vars: BTreeSet<String> = plan.vars.keys().cloned().collect();
    validate_level(plan.id.as_str(), &plan.graph, registry, &known_vars, &mut messages, true);

    if let Some(cycle) = DependencyGraph::build(&plan.graph).detect_cycle() {
        messages.push(format!("cycle detected among nodes: {cycle:?}"));
    }

    for entry in &plan.ui.layout {
        if plan.node(entry).is_none() {
            messages.push(format!("ui.layout entry `{entry}` names no defined node"));
        }
    }

    if messages.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::ValidationError { messages })
    }
}

/// Checks 1, 2, 3, 6, 7, 8 — everything that can be checked against a flat
/// node list without reference to the whole-Plan UI layout. Applied
/// recursively to loop-body graphs, so nested Plans get the same scrutiny
/// as the top level. `known_vars` is the set of `${vars.K}` keys resolvable
/// at this level: the Plan's own `vars` map at the top level, plus a loop
/// body's `item_var`/`index_var` once recursed into a `foreach` body.
fn validate_level(
    level_name: &str,
    nodes: &[Node],
    registry: &Registry,
    known_vars: &BTreeSet<String>,
    messages: &mut Vec<String>,
    has_subflow_scope: bool,
) {
    // Check 1: node id uniqueness.
    let mut seen = BTreeSet::new();
    for node in nodes {
        if !seen.insert(node.id.clone()) {
            messages.push(format!("duplicate node id `{}` in `{level_name}`", node.id));
        }
    }
    let known_ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();

    for node in nodes {
        match &node.kind {
            NodeKind::Block(b) => {
                // Check 2: registry binding.
                match registry.spec(&b.block_id, b.block_version.as_deref()) {
                    Ok(spec) => {
                        for (input_name, schema) in &spec.inputs {
                            if schema.required && !b.inputs.contains_key(input_name) && schema.default.is_none() {
                                messages.push(format!(
                                    "node `{}` is missing required input `{input_name}` for block `{}`",
                                    node.id, b.block_id
                                ));
                            }
                        }
                        for input_name in b.inputs.keys() {
                            if !spec.inputs.contains_key(input_name) {
                                messages.push(format!(
                                    "node `{}` sets input `{input_name}` not declared by block `{}`",
                                    node.id, b.block_id
                                ));
                            }
                        }
                        for block_output in b.out.keys() {
                            if !spec.outputs.contains_key(block_output) {
                                messages.push(format!(
                                    "node `{}` aliases output `{block_output}` not declared by block `{}`",
                                    node.id, b.block_id
                                ));
                            }
                        }
                    }
                    Err(e) => messages.push(format!("node `{}`: {e}", node.id)),
                }

                // Check 3: reference resolvability (static-only parts).
                for input in b.inputs.values() {
                    check_static_refs(&node.id, input, known_vars, messages);
                }
                if let Some(guard) = &b.when {
                    check_guard_static_refs(&node.id, guard, known_vars, messages);
                    // Check 6: guard syntax.
                    if let Guard::Expr { expr } = guard {
                        if let Err(e) = expr::check_syntax(expr) {
                            messages.push(format!("node `{}` has an unsafe guard expression: {e}", node.id));
                        }
                    }
                }
            }
            NodeKind::Loop(l) => {
                match &l.spec {
                    LoopSpec::Foreach(f) => {
                        check_static_refs(&node.id, &f.input, known_vars, messages);
                        // Check 7: when foreach.input is a literal (no
                        // placeholders to resolve later), it must already
                        // be iterable.
                        if !contains_placeholder(&f.input) && f.input.iter_elements().is_none() {
                            messages.push(format!(
                                "node `{}`'s foreach.input is statically known but not iterable",
                                node.id
                            ));
                        }
                    }
                    LoopSpec::While(w) => {
                        check_guard_static_refs(&node.id, &w.condition, known_vars, messages);
                        if let Guard::Expr { expr } = &w.condition {
                            if let Err(e) = expr::check_syntax(expr) {
                                messages.push(format!(
                                    "node `{}`'s while.condition is an unsafe expression: {e}",
                                    node.id
                                ));
                            }
                        }
                        if w.max_iterations < 1 {
                            messages.push(format!(
                                "node `{}`'s while.max_iterations must be >= 1, got {}",
                                node.id, w.max_iterations
                            ));
                        }
                    }
                }
                // A `foreach` body additionally sees `item_var`/`index_var`
                // as defined `vars` keys; a `while` body sees nothing new.
                let mut body_vars = known_vars.clone();
                if let LoopSpec::Foreach(f) = &l.spec {
                    body_vars.insert(f.item_var.clone());
                    if let Some(index_var) = &f.index_var {
                        body_vars.insert(index_var.clone());
                    }
                }
                validate_level(
                    &format!("{level_name}/{}", node.id),
                    &l.body.graph,
                    registry,
                    &body_vars,
                    messages,
                    false,
                );
            }
            NodeKind::Subflow(s) => {
                for input in s.inputs.values() {
                    check_static_refs(&node.id, input, known_vars, messages);
                }
                // Check 8: subflow plan resolvability is Runner-registry
                // dependent (the child Plan may live in a different file);
                // we can only assert the reference shape is well-formed
                // here, documented as a Runner-time (not static) check in
                // DESIGN.md since the Validator has no Plan lookup table.
                if s.plan_id.trim().is_empty() {
                    messages.push(format!("node `{}`'s subflow call names no plan_id", node.id));
                }
                let _ = has_subflow_scope;
            }
        }
    }
    let _ = known_ids;
}

fn contains_placeholder(value: &Value) -> bool {
    match value {
        Value::String(s) => !reference::scan_placeholders(s).is_empty(),
        Value::Array(items) => items.iter().any(contains_placeholder),
        Value::Object(map) => map.values().any(contains_placeholder),
        _ => false,
    }
}

fn check_static_refs(node_id: &str, value: &Value, known_vars: &BTreeSet<String>, messages: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            for ph in reference::scan_placeholders(s) {
                match ph.head.as_str() {
                    "vars" => {
                        let Some(key) = ph.path.first() else {
                            messages.push(format!("node `{node_id}` references `${{vars}}` with no key"));
                            continue;
                        };
                        if !known_vars.contains(key) {
                            messages.push(format!(
                                "node `{node_id}` references undefined variable `{key}`"
                            ));
                        }
                    }
                    "config" => {
                        // Definedness against the concrete ConfigStore is
                        // checked by the Runner at resolution time, where
                        // the actual config tree is in scope; the Validator
                        // only confirms the placeholder names a path
                        // segment at all.
                        if ph.path.is_empty() {
                            messages.push(format!(
                                "node `{node_id}` references `${{{}}}` with no key path",
                                ph.head
                            ));
                        }
                    }
                    "env" => {
                        let Some(key) = ph.path.first() else {
                            messages.push(format!("node `{node_id}` references `${{env}}` with no key"));
                            continue;
                        };
                        if std::env::var(key).is_err() {
                            messages.push(format!(
                                "node `{node_id}` references undefined environment key `{key}`"
                            ));
                        }
                    }
                    _ => {
                        // Node-alias references are checked by the
                        // Dependency Graph Builder's cycle pass and by the
                        // Runner at resolution time (the producing node may
                        // be validated-but-not-yet-run).
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                check_static_refs(node_id, item, known_vars, messages);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                check_static_refs(node_id, v, known_vars, messages);
            }
        }
        _ => {}
    }
}

fn check_guard_static_refs(node_id: &str, guard: &Guard, known_vars: &BTreeSet<String>, messages: &mut Vec<String>) {
    match guard {
        Guard::Expr { expr } => check_static_refs(node_id, &Value::String(expr.clone()), known_vars, messages),
        Guard::Structured { left, right, .. } => {
            check_static_refs(node_id, left, known_vars, messages);
            check_static_refs(node_id, right, known_vars, messages);
        }
    }
}
