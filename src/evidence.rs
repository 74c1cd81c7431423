//! Evidence / Event Logger (§4.8): an append-only newline-delimited JSON
//! event log per run, plus per-node artifact materialization.
//!
//! Every record carries `{ts, plan_id, run_id, schema: "v1", type, ...}`
//! (§4.8). Writes are serialized behind a mutex — "a single
//! append-serializing primitive guards the writer; each record is a single
//! line so partial reads remain parseable" (§9). Timestamps come from
//! `chrono::Utc::now()` and are monotonic per run by construction: the
//! mutex that serializes writes also serializes the clock reads that
//! produce `ts` (§8: "for every two successive `ts` fields emitted from the
//! same process, `ts_n <= ts_{n+1}`").

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value as Json;

use crate::errors::RunnerError;
use crate::integrity::IntegrityHash;
use crate::value::Value;

/// One JSONL record. `type_` plus arbitrary fields flattened alongside the
/// required envelope (`ts`, `plan_id`, `run_id`, `schema`).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub plan_id: String,
    pub run_id: String,
    pub schema: &'static str,
    #[serde(rename = "type")]
    pub type_: &'static str,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Json>,
}

/// Append-only event sink bound to `runs/<plan_id>/<run_id>.jsonl` (§3,
/// §6 "Persisted layout").
pub struct EventLogger {
    plan_id: String,
    run_id: String,
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl EventLogger {
    pub fn open(runs_dir: &Path, plan_id: &str, run_id: &str) -> Result<Self, RunnerError> {
        let dir = runs_dir.join(plan_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{run_id}.jsonl"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            plan_id: plan_id.to_string(),
            run_id: run_id.to_string(),
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Emit a `type` event carrying `fields`, which must serialize to a
    /// JSON object (a programming error otherwise — all call sites below
    /// pass struct literals, never scalars).
    pub fn emit<T: Serialize>(&self, type_: &'static str, fields: T) -> Result<(), RunnerError> {
        let value = serde_json::to_value(fields)?;
        let fields_map = match value {
            Json::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        let event = Event {
            ts: chrono::Utc::now(),
            plan_id: self.plan_id.clone(),
            run_id: self.run_id.clone(),
            schema: "v1",
            type_,
            fields: fields_map,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line)?;
        file.flush()?;
        tracing::debug!(event = type_, run_id = %self.run_id, "evidence event emitted");
        Ok(())
    }

    /// Materialize a per-node output snapshot under
    /// `runs/<plan_id>/<run_id>/artifacts/<node_id>_outputs.json`. Binary
    /// file descriptors (`{name, bytes}`/`{name, base64}`) are additionally
    /// written out as raw bytes alongside the JSON under their declared
    /// filename (§4.8).
    ///
    /// Each write is skipped when the integrity hash of the new content
    /// matches a file already on disk under that name, so re-materializing
    /// an unchanged node (a retried attempt, a resumed run) does not touch
    /// the artifact's mtime or incur a redundant write.
    pub fn materialize_artifacts(
        &self,
        runs_dir: &Path,
        node_id: &str,
        outputs: &BTreeMap<String, Value>,
    ) -> Result<(), RunnerError> {
        let artifacts_dir = runs_dir.join(&self.plan_id).join(&self.run_id).join("artifacts");
        std::fs::create_dir_all(&artifacts_dir)?;

        let json: BTreeMap<String, Json> = outputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        let snapshot_path = artifacts_dir.join(format!("{node_id}_outputs.json"));
        write_if_changed(&snapshot_path, &serde_json::to_vec_pretty(&json)?)?;

        for value in outputs.values() {
            if let Some((name, bytes)) = value.as_binary_descriptor() {
                let safe_name = Path::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| name.to_string());
                write_if_changed(&artifacts_dir.join(safe_name), &bytes)?;
            }
        }
        Ok(())
    }
}

/// Write `content` to `path` unless a file already there hashes identically.
fn write_if_changed(path: &Path, content: &[u8]) -> Result<(), RunnerError> {
    if let Ok(existing) = std::fs::read(path) {
        if IntegrityHash::compute(&existing) == IntegrityHash::compute(content) {
            return Ok(());
        }
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn emits_newline_delimited_json_with_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::open(dir.path(), "demo", "run-1").unwrap();
        logger
            .emit("node_start", serde_json::json!({"node_id": "A", "block": "double", "attempt": 1}))
            .unwrap();
        logger
            .emit("node_finish", serde_json::json!({"node_id": "A", "elapsed_ms": 5, "attempts": 1}))
            .unwrap();

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: Json = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["plan_id"], "demo");
            assert_eq!(parsed["run_id"], "run-1");
            assert_eq!(parsed["schema"], "v1");
            assert!(parsed["ts"].is_string());
        }
    }

    #[test]
    fn materializes_artifacts_and_binary_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::open(dir.path(), "demo", "run-1").unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("y".to_string(), Value::from(42i64));
        let descriptor = Value::Object(BTreeMap::from([
            ("name".to_string(), Value::from("report.txt")),
            ("base64".to_string(), Value::from("aGVsbG8=")),
        ]));
        outputs.insert("file".to_string(), descriptor);

        logger.materialize_artifacts(dir.path(), "A", &outputs).unwrap();

        let artifacts_dir = dir.path().join("demo").join("run-1").join("artifacts");
        let snapshot: Json =
            serde_json::from_str(&std::fs::read_to_string(artifacts_dir.join("A_outputs.json")).unwrap())
                .unwrap();
        assert_eq!(snapshot["y"], 42);
        let bytes = std::fs::read(artifacts_dir.join("report.txt")).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn rematerializing_unchanged_outputs_skips_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::open(dir.path(), "demo", "run-1").unwrap();
        let mut outputs = BTreeMap::new();
        outputs.insert("y".to_string(), Value::from(42i64));

        logger.materialize_artifacts(dir.path(), "A", &outputs).unwrap();
        let artifacts_dir = dir.path().join("demo").join("run-1").join("artifacts");
        let snapshot_path = artifacts_dir.join("A_outputs.json");
        let first_mtime = std::fs::metadata(&snapshot_path).unwrap().modified().unwrap();

        logger.materialize_artifacts(dir.path(), "A", &outputs).unwrap();
        let second_mtime = std::fs::metadata(&snapshot_path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn reads_back_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::open(dir.path(), "demo", "run-1").unwrap();
        logger.emit("start", serde_json::json!({})).unwrap();
        let file = std::fs::File::open(logger.path()).unwrap();
        let reader = std::io::BufReader::new(file);
        assert_eq!(reader.lines().count(), 1);
    }
}
