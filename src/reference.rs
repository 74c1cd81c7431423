//! Reference Resolver (§4.2).
//!
//! Substitutes `${identifier(.path)*}` placeholders found anywhere in a
//! value tree against a [`Scope`]: `vars.*`, `env.*`, `config.*`, or a node
//! alias `node_id.alias[.path]`. Two substitution modes apply depending on
//! where the placeholder sits in its enclosing string (§4.2):
//!
//! - **Sole content** (`"${A.v}"`) — substituted with the resolved value's
//!   native type, preserving ints/bools/objects.
//! - **Embedded** (`"total: ${A.v} items"`) — the resolved value is
//!   stringified and spliced into the surrounding text.
//!
//! The scanner here is also reused by the Dependency Graph Builder (§4.4,
//! [`crate::graph`]) to find the node ids a placeholder references, and by
//! the Expression Evaluator (§4.3, [`crate::expr`]) to pre-substitute
//! placeholders inside guard text before parsing.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigStore;
use crate::errors::RunnerError;
use crate::value::Value;

/// A single `${...}` placeholder found in a string, with its byte span in
/// the original text and the parsed dotted/indexed path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub start: usize,
    pub end: usize,
    pub head: String,
    pub path: Vec<String>,
}

/// Scan `s` for `${...}` placeholders. Malformed placeholders (unterminated
/// `${`, empty body) are simply not reported — they are left as literal
/// text, matching the teacher's tolerant-parsing posture elsewhere (e.g.
/// `RawNode`'s permissive deserialize-then-narrow shape).
pub fn scan_placeholders(s: &str) -> Vec<Placeholder> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(end_rel) = s[i + 2..].find('}') {
                let end = i + 2 + end_rel;
                let body = &s[i + 2..end];
                if let Some((head, path)) = parse_placeholder_body(body) {
                    out.push(Placeholder {
                        start: i,
                        end: end + 1,
                        head,
                        path,
                    });
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
    out
}

/// Parse `identifier(.segment | [index])*` into `(head, path_segments)`.
fn parse_placeholder_body(body: &str) -> Option<(String, Vec<String>)> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let mut chars = body.char_indices().peekable();
    let mut head = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            head.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if head.is_empty() || head.chars().next().unwrap().is_numeric() {
        return None;
    }
    let rest = &body[head.len()..];
    let path = parse_path_segments(rest)?;
    Some((head, path))
}

/// Parse the remainder of a placeholder path (`.seg`, `[0]`) into flat
/// segments. List indices are kept as their string form; [`Value`]'s
/// `get_path_segment` parses them back into `usize` when traversing arrays.
fn parse_path_segments(mut rest: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let end = tail
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(tail.len());
            let (seg, remainder) = tail.split_at(end);
            if seg.is_empty() {
                return None;
            }
            segments.push(seg.to_string());
            rest = remainder;
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']')?;
            let (seg, remainder) = tail.split_at(end);
            segments.push(seg.to_string());
            rest = &remainder[1..];
        } else {
            return None;
        }
    }
    Some(segments)
}

/// The resolution scope: `vars`, `env`, `config`, and the outputs produced
/// so far by sibling/ancestor nodes in this graph level.
pub struct Scope<'a> {
    pub vars: &'a BTreeMap<String, Value>,
    pub config: &'a ConfigStore,
    /// `node_id -> alias -> value`, populated by the Runner as nodes finish.
    pub outputs: &'a BTreeMap<String, BTreeMap<String, Value>>,
    /// Every node id known at this graph level, used to distinguish "not
    /// produced yet" (→ `Pending`) from "no such node" (→ hard error).
    pub known_node_ids: &'a BTreeSet<String>,
    /// Node ids that are known but will *never* produce outputs this
    /// scheduling round — skipped by a falsy guard, or failed under
    /// `on_error: continue` (§4.7.3). A reference to one of these is a
    /// `DependencyFailed` error rather than `Pending`, since no amount of
    /// further scheduling will resolve it (spec §"DEPENDENCY_FAILED").
    pub terminal_absent: &'a BTreeSet<String>,
}

/// Outcome of attempting to resolve a value tree at scheduling time: either
/// fully resolved, or blocked on a node that exists but hasn't finished yet.
pub enum Resolution {
    Ready(Value),
    Pending(String),
}

/// Resolve `value`, treating an unresolvable-but-not-yet-produced node
/// reference as a hard error rather than deferring. Used once a Plan has
/// passed validation and its references are expected to be resolvable (the
/// Dry-run Engine, loop/subflow input binding, and the final node dispatch
/// after the scheduler has already confirmed readiness).
pub fn resolve(value: &Value, scope: &Scope) -> Result<Value, RunnerError> {
    match try_resolve(value, scope)? {
        Resolution::Ready(v) => Ok(v),
        Resolution::Pending(node_id) => Err(RunnerError::UnresolvedReference(node_id)),
    }
}

/// Resolve `value`, returning [`Resolution::Pending`] instead of erroring
/// when a placeholder names a known node whose output isn't available yet
/// (§4.2). The scheduler uses this to re-queue a node rather than fail it.
pub fn try_resolve(value: &Value, scope: &Scope) -> Result<Resolution, RunnerError> {
    match value {
        Value::String(s) => resolve_string(s, scope),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match try_resolve(item, scope)? {
                    Resolution::Ready(v) => out.push(v),
                    pending => return Ok(pending),
                }
            }
            Ok(Resolution::Ready(Value::Array(out)))
        }
        Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                match try_resolve(v, scope)? {
                    Resolution::Ready(rv) => {
                        out.insert(k.clone(), rv);
                    }
                    pending => return Ok(pending),
                }
            }
            Ok(Resolution::Ready(Value::Object(out)))
        }
        other => Ok(Resolution::Ready(other.clone())),
    }
}

fn resolve_string(s: &str, scope: &Scope) -> Result<Resolution, RunnerError> {
    let placeholders = scan_placeholders(s);
    if placeholders.is_empty() {
        return Ok(Resolution::Ready(Value::String(s.to_string())));
    }
    // Sole-content substitution: the whole string is exactly one placeholder.
    if placeholders.len() == 1 && placeholders[0].start == 0 && placeholders[0].end == s.len() {
        return match resolve_placeholder(&placeholders[0], scope)? {
            Resolution::Ready(v) => Ok(Resolution::Ready(v)),
            pending => Ok(pending),
        };
    }
    // Embedded substitution: stringify each match and splice into the text.
    let mut result = String::with_capacity(s.len());
    let mut cursor = 0;
    for ph in &placeholders {
        result.push_str(&s[cursor..ph.start]);
        match resolve_placeholder(ph, scope)? {
            Resolution::Ready(v) => result.push_str(&v.to_string()),
            pending => return Ok(pending),
        }
        cursor = ph.end;
    }
    result.push_str(&s[cursor..]);
    Ok(Resolution::Ready(Value::String(result)))
}

fn resolve_placeholder(ph: &Placeholder, scope: &Scope) -> Result<Resolution, RunnerError> {
    let full_name = || {
        let mut s = ph.head.clone();
        for seg in &ph.path {
            s.push('.');
            s.push_str(seg);
        }
        s
    };

    let root = match ph.head.as_str() {
        "vars" => {
            let key = ph
                .path
                .first()
                .ok_or_else(|| RunnerError::UnresolvedReference(full_name()))?;
            let v = scope
                .vars
                .get(key)
                .ok_or_else(|| RunnerError::UnresolvedReference(full_name()))?;
            traverse(v, &ph.path[1..]).ok_or_else(|| RunnerError::UnresolvedReference(full_name()))?
        }
        "env" => {
            let key = ph
                .path
                .first()
                .ok_or_else(|| RunnerError::EnvKeyMissing(full_name()))?;
            let raw = std::env::var(key).map_err(|_| RunnerError::EnvKeyMissing(key.clone()))?;
            if ph.path.len() > 1 {
                return Err(RunnerError::UnresolvedReference(full_name()));
            }
            Value::String(raw)
        }
        "config" => {
            let path = ph.path.join(".");
            scope
                .config
                .resolve(&path)
                .map_err(|_| RunnerError::ConfigKeyMissing(path))?
        }
        node_id => {
            if !scope.known_node_ids.contains(node_id) {
                return Err(RunnerError::UnresolvedReference(full_name()));
            }
            let Some(node_outputs) = scope.outputs.get(node_id) else {
                if scope.terminal_absent.contains(node_id) {
                    return Err(RunnerError::DependencyFailed(node_id.to_string()));
                }
                return Ok(Resolution::Pending(node_id.to_string()));
            };
            let alias = ph
                .path
                .first()
                .ok_or_else(|| RunnerError::UnresolvedReference(full_name()))?;
            let Some(v) = node_outputs.get(alias) else {
                return Err(RunnerError::UnresolvedReference(full_name()));
            };
            traverse(v, &ph.path[1..]).ok_or_else(|| RunnerError::UnresolvedReference(full_name()))?
        }
    };
    Ok(Resolution::Ready(root))
}

fn traverse(value: &Value, segments: &[String]) -> Option<Value> {
    let mut current = value;
    for seg in segments {
        current = current.get_path_segment(seg)?;
    }
    Some(current.clone())
}

/// Heads of every placeholder in `value` that name one of `known_ids`,
/// used by the Dependency Graph Builder (§4.4) to collect edges. `vars`,
/// `env`, and `config` placeholders never produce edges.
pub fn node_refs_in(value: &Value, known_ids: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_node_refs(value, known_ids, &mut out);
    out
}

fn collect_node_refs(value: &Value, known_ids: &BTreeSet<String>, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for ph in scan_placeholders(s) {
                if known_ids.contains(&ph.head) {
                    out.insert(ph.head);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_node_refs(item, known_ids, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                collect_node_refs(v, known_ids, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_scope<'a>(
        vars: &'a BTreeMap<String, Value>,
        config: &'a ConfigStore,
        outputs: &'a BTreeMap<String, BTreeMap<String, Value>>,
        known: &'a BTreeSet<String>,
        terminal_absent: &'a BTreeSet<String>,
    ) -> Scope<'a> {
        Scope {
            vars,
            config,
            outputs,
            known_node_ids: known,
            terminal_absent,
        }
    }

    #[test]
    fn resolving_a_tree_with_no_placeholders_is_identity() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let outputs = BTreeMap::new();
        let known = BTreeSet::new();
        let terminal_absent = BTreeSet::new();
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        let tree = Value::Object(BTreeMap::from([
            ("a".to_string(), Value::from(1i64)),
            ("b".to_string(), Value::Array(vec![Value::from("x")])),
        ]));
        assert_eq!(resolve(&tree, &scope).unwrap(), tree);
    }

    #[test]
    fn sole_content_placeholder_preserves_native_type() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "A".to_string(),
            BTreeMap::from([("v".to_string(), Value::from(7i64))]),
        );
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::new();
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        let resolved = resolve(&Value::from("${A.v}"), &scope).unwrap();
        assert_eq!(resolved, Value::from(7i64));
    }

    #[test]
    fn embedded_placeholder_is_stringified() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "A".to_string(),
            BTreeMap::from([("v".to_string(), Value::from(7i64))]),
        );
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::new();
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        let resolved = resolve(&Value::from("total: ${A.v} items"), &scope).unwrap();
        assert_eq!(resolved, Value::from("total: 7 items"));
    }

    #[test]
    fn unproduced_known_node_yields_pending() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let outputs = BTreeMap::new();
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::new();
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        match try_resolve(&Value::from("${A.v}"), &scope).unwrap() {
            Resolution::Pending(node_id) => assert_eq!(node_id, "A"),
            Resolution::Ready(_) => panic!("expected pending"),
        }
    }

    #[test]
    fn unknown_node_is_a_hard_error() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let outputs = BTreeMap::new();
        let known = BTreeSet::new();
        let terminal_absent = BTreeSet::new();
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        let err = resolve(&Value::from("${ghost.v}"), &scope).unwrap_err();
        assert_eq!(err.code(), "UNRESOLVED_REFERENCE");
    }

    #[test]
    fn terminally_absent_dependency_is_a_dependency_failed_error() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let outputs = BTreeMap::new();
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::from(["A".to_string()]);
        let scope = empty_scope(&vars, &config, &outputs, &known, &terminal_absent);

        let err = resolve(&Value::from("${A.v}"), &scope).unwrap_err();
        assert_eq!(err.code(), "DEPENDENCY_FAILED");
    }

    #[test]
    fn node_refs_ignore_vars_env_config() {
        let known = BTreeSet::from(["A".to_string(), "B".to_string()]);
        let tree = Value::Object(BTreeMap::from([
            ("x".to_string(), Value::from("${A.v}")),
            ("y".to_string(), Value::from("${vars.k}")),
            ("z".to_string(), Value::from("${env.K}")),
        ]));
        let refs = node_refs_in(&tree, &known);
        assert_eq!(refs, BTreeSet::from(["A".to_string()]));
    }
}
