//! Layered configuration store.
//!
//! `${config.*}` placeholders resolve against a tree built by loading an
//! ordered list of YAML/JSON files from a directory: later files override
//! earlier ones at the leaf level. Loading is lazy — the first call to
//! [`ConfigStore::resolve`] triggers the merge; subsequent calls reuse it.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::RunnerError;
use crate::value::Value;

/// Lazily-loaded layered configuration tree.
pub struct ConfigStore {
    dirs: Vec<PathBuf>,
    tree: OnceLock<Value>,
}

impl ConfigStore {
    /// Create a store that will merge config files found (non-recursively)
    /// under each of `dirs`, in order — later directories win on conflict.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            tree: OnceLock::new(),
        }
    }

    /// A store with no backing directories; every `Resolve` fails with
    /// `ConfigKeyMissing`. Useful for Plans that declare no `${config.*}`
    /// references.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Resolve a dotted path (e.g. `database.host`) against the merged
    /// configuration tree.
    pub fn resolve(&self, path: &str) -> Result<Value, RunnerError> {
        let tree = self.tree_or_load()?;
        let mut current = tree;
        for segment in path.split('.') {
            match current.get_path_segment(segment) {
                Some(v) => current = v,
                None => return Err(RunnerError::ConfigKeyMissing(path.to_string())),
            }
        }
        Ok(current.clone())
    }

    /// Whether `path` is present, without raising. Used by the Validator
    /// (§4.5 check 3) to report all unresolvable references at once rather
    /// than aborting on the first.
    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }

    fn tree_or_load(&self) -> Result<&Value, RunnerError> {
        if let Some(tree) = self.tree.get() {
            return Ok(tree);
        }
        let merged = self.load_merged()?;
        Ok(self.tree.get_or_init(|| merged))
    }

    fn load_merged(&self) -> Result<Value, RunnerError> {
        let mut merged = Value::Object(Default::default());
        for dir in &self.dirs {
            let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
                Ok(rd) => rd
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| is_config_file(p))
                    .collect(),
                Err(_) => continue,
            };
            entries.sort();
            for path in entries {
                let text = std::fs::read_to_string(&path)?;
                let doc: Value = Value::from_json(serde_yaml::from_str::<serde_json::Value>(&text)?);
                merge_in_place(&mut merged, doc);
            }
        }
        Ok(merged)
    }
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Merge `overlay` onto `base` in place: objects merge key-by-key
/// (recursively), any other value kind simply replaces the base value.
fn merge_in_place(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_in_place(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}
