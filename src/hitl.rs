//! HITL Coordinator (§4.7.6, §6): persists and reloads the Run State
//! Snapshot that lets a suspended Run resume, including across process
//! restarts ("cooperative suspension across process boundary", §9).
//!
//! The snapshot is the authoritative resume record — the in-memory
//! [`ExecutionContext`] is reconstructed from it rather than assumed to
//! still be alive in the same process (§9). Writes are atomic
//! (write-to-temp-then-rename, §5) so a crash mid-write never leaves a
//! torn, half-updated file behind for the next resume attempt to trip over.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::context::{ExecutionContext, PendingUi};
use crate::errors::RunnerError;
use crate::value::Value;

/// Bytes-valued outputs are base64-encoded when persisted (§3), so the
/// snapshot stays plain JSON. [`EncodedValue`] wraps a [`Value`] tree with
/// that encoding applied/reversed at the boundary.
///
/// `node_outputs` is additive beyond the four fields §3 names
/// (`ui_outputs`, `pending_ui`, `success_nodes`, `vars_overrides`):
/// reconstructing a resumed Run's already-completed node outputs purely
/// from `success_nodes` would require re-executing every prior Processing
/// Block and trusting it to be perfectly pure rather than merely
/// "effectively deterministic" (§4.1) — risky for Blocks that read
/// external systems. Persisting the resolved outputs sidesteps that
/// replay. See DESIGN.md for the full rationale; the four spec-named
/// fields still round-trip bitwise on their own (§8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateSnapshot {
    pub ui_outputs: BTreeMap<String, Value>,
    pub pending_ui: Option<PendingUi>,
    pub success_nodes: Vec<String>,
    pub vars_overrides: BTreeMap<String, Value>,
    #[serde(default)]
    pub node_outputs: BTreeMap<String, BTreeMap<String, Value>>,
}

impl RunStateSnapshot {
    pub fn capture(ctx: &ExecutionContext) -> Self {
        Self {
            ui_outputs: encode_bytes_tree(&ctx.ui_outputs),
            pending_ui: ctx.pending_ui.clone(),
            success_nodes: ctx.success_nodes.clone(),
            vars_overrides: ctx.vars_overrides.clone(),
            node_outputs: ctx
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), encode_bytes_tree(v)))
                .collect(),
        }
    }

    pub fn apply_to(&self, ctx: &mut ExecutionContext) {
        ctx.ui_outputs = decode_bytes_tree(&self.ui_outputs);
        ctx.pending_ui = self.pending_ui.clone();
        ctx.success_nodes = self.success_nodes.clone();
        ctx.outputs = self
            .node_outputs
            .iter()
            .map(|(k, v)| (k.clone(), decode_bytes_tree(v)))
            .collect();
        ctx.vars_overrides = self.vars_overrides.clone();
    }
}

fn encode_bytes_tree(map: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), encode_bytes_value(v))).collect()
}

fn decode_bytes_tree(map: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    map.iter().map(|(k, v)| (k.clone(), decode_bytes_value(v))).collect()
}

/// Values are plain JSON already except for the binary-descriptor shapes
/// §4.8 defines (`{name, bytes}` -> normalized to `{name, base64}`); this
/// keeps the on-disk snapshot textual even when the raw form was a byte
/// array.
fn encode_bytes_value(value: &Value) -> Value {
    if let Some((name, bytes)) = value.as_binary_descriptor() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        return Value::Object(BTreeMap::from([
            ("name".to_string(), Value::from(name)),
            ("base64".to_string(), Value::from(encoded)),
        ]));
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(encode_bytes_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), encode_bytes_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn decode_bytes_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(decode_bytes_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), decode_bytes_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn snapshot_path(runs_dir: &Path, plan_id: &str, run_id: &str) -> PathBuf {
    runs_dir.join(plan_id).join(format!("{run_id}.state.json"))
}

/// Write `snapshot` atomically: serialize to a temp file in the same
/// directory, then rename over the destination (§5, §9).
pub fn save_state(
    runs_dir: &Path,
    plan_id: &str,
    run_id: &str,
    snapshot: &RunStateSnapshot,
) -> Result<(), RunnerError> {
    let dest = snapshot_path(runs_dir, plan_id, run_id);
    std::fs::create_dir_all(dest.parent().expect("snapshot path has a parent"))?;
    let bytes = serde_json::to_vec_pretty(snapshot)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dest.parent().unwrap())?;
    use std::io::Write;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.persist(&dest)
        .map_err(|e| RunnerError::IOError(e.error))?;
    Ok(())
}

pub fn get_state(runs_dir: &Path, plan_id: &str, run_id: &str) -> Result<Option<RunStateSnapshot>, RunnerError> {
    let path = snapshot_path(runs_dir, plan_id, run_id);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Find the most recently suspended pending UI wait for `plan_id`, scanning
/// every run's snapshot under `runs/<plan_id>/`. When `prefer_run_id` is
/// given and has a pending wait, it is returned without scanning further
/// (the common "resume this specific run" case).
pub fn find_latest_pending_ui(
    runs_dir: &Path,
    plan_id: &str,
    prefer_run_id: Option<&str>,
) -> Result<Option<(PendingUi, String)>, RunnerError> {
    if let Some(run_id) = prefer_run_id {
        if let Some(snapshot) = get_state(runs_dir, plan_id, run_id)? {
            if let Some(pending) = snapshot.pending_ui {
                return Ok(Some((pending, run_id.to_string())));
            }
        }
    }

    let dir = runs_dir.join(plan_id);
    if !dir.exists() {
        return Ok(None);
    }
    let mut candidates: Vec<(std::time::SystemTime, RunStateSnapshot, String)> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(run_id) = name.strip_suffix(".state.json") else {
            continue;
        };
        if let Some(snapshot) = get_state(runs_dir, plan_id, run_id)? {
            if snapshot.pending_ui.is_some() {
                let modified = entry.metadata()?.modified()?;
                candidates.push((modified, snapshot, run_id.to_string()));
            }
        }
    }
    candidates.sort_by_key(|(modified, _, _)| *modified);
    Ok(candidates
        .pop()
        .map(|(_, snapshot, run_id)| (snapshot.pending_ui.expect("filtered above"), run_id)))
}

/// Remove every persisted state snapshot (and event log) for `plan_id`.
pub fn clear_state_files(runs_dir: &Path, plan_id: &str) -> Result<(), RunnerError> {
    let dir = runs_dir.join(plan_id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_reload_round_trips_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ExecutionContext::new("demo", "run-1", BTreeMap::new());
        ctx.ui_outputs.insert(
            "U".to_string(),
            Value::Object(BTreeMap::from([("x".to_string(), Value::from(42i64))])),
        );
        ctx.pending_ui = Some(PendingUi {
            node_id: "U".to_string(),
            input_snapshot: BTreeMap::new(),
            since: chrono::Utc::now(),
        });
        ctx.success_nodes.push("A".to_string());

        let snapshot = RunStateSnapshot::capture(&ctx);
        save_state(dir.path(), "demo", "run-1", &snapshot).unwrap();

        let reloaded = get_state(dir.path(), "demo", "run-1").unwrap().expect("present");
        assert_eq!(reloaded.success_nodes, snapshot.success_nodes);
        assert_eq!(reloaded.ui_outputs, snapshot.ui_outputs);
        assert_eq!(
            reloaded.pending_ui.as_ref().map(|p| p.node_id.clone()),
            Some("U".to_string())
        );
    }

    #[test]
    fn bytes_survive_base64_round_trip() {
        let mut ctx = ExecutionContext::new("demo", "run-1", BTreeMap::new());
        let descriptor = Value::Object(BTreeMap::from([
            ("name".to_string(), Value::from("f.bin")),
            ("bytes".to_string(), Value::Array(vec![Value::from(104i64), Value::from(105i64)])),
        ]));
        ctx.ui_outputs.insert("U".to_string(), descriptor);

        let snapshot = RunStateSnapshot::capture(&ctx);
        let encoded = snapshot.ui_outputs.get("U").unwrap();
        assert!(encoded.as_object().unwrap().contains_key("base64"));

        let mut restored_ctx = ExecutionContext::new("demo", "run-1", BTreeMap::new());
        snapshot.apply_to(&mut restored_ctx);
        let (name, bytes) = restored_ctx.ui_outputs["U"].as_binary_descriptor().unwrap();
        assert_eq!(name, "f.bin");
        assert_eq!(bytes, vec![104, 105]);
    }

    #[test]
    fn find_latest_pending_ui_prefers_requested_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ExecutionContext::new("demo", "run-1", BTreeMap::new());
        ctx.pending_ui = Some(PendingUi {
            node_id: "U".to_string(),
            input_snapshot: BTreeMap::new(),
            since: chrono::Utc::now(),
        });
        save_state(dir.path(), "demo", "run-1", &RunStateSnapshot::capture(&ctx)).unwrap();

        let (pending, run_id) = find_latest_pending_ui(dir.path(), "demo", Some("run-1"))
            .unwrap()
            .expect("pending present");
        assert_eq!(pending.node_id, "U");
        assert_eq!(run_id, "run-1");
    }
}
