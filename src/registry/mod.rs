//! Block Registry (§4.1): discovers Block Specs, selects a version, and
//! constructs/holds Block instances on demand.
//!
//! Individual Block implementations (spreadsheet I/O, archive parsing, LLM
//! adapters, etc.) are explicitly out of scope (§1) — this module owns only
//! the uniform interface Blocks present to the Runner/Validator/Dry-run
//! Engine, plus a small set of builtin reference Blocks ([`builtin`]) used
//! to exercise that interface end to end in this crate's own tests.
//!
//! Many worker tasks call [`Registry::get`] concurrently while a Run is
//! mid-execution, and in a long-lived host process `load_specs` may be
//! re-invoked to pick up newly deployed Block Specs without a restart
//! (§4.1) — so the registry is a concurrent map (`dashmap`), not a
//! single global lock, matching the teacher's own `Waitlist` shape.

pub mod builtin;
pub mod spec;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use semver::Version;

use crate::errors::RunnerError;
use crate::value::Value;
use spec::BlockSpec;

/// Outcome of a UI Block's `render` call (§6): either it produced outputs,
/// or it is requesting to suspend the Run pending external input.
#[derive(Debug, Clone)]
pub enum RenderOutcome {
    Ready(BTreeMap<String, Value>),
    AwaitUi { snapshot: Option<Value> },
}

/// The uniform interface the Registry standardizes every Block into
/// (§4.1). Processing Blocks implement `run`; UI Blocks additionally
/// implement `render`. Modeled as `async_trait` methods on one trait (with
/// a default `render` that errors) rather than two traits plus a manual
/// downcast, so the Runner can hold a single `Arc<dyn Block>` regardless of
/// variant and only UI-layout membership (not the Rust type) decides which
/// call it makes.
#[async_trait]
pub trait Block: Send + Sync {
    fn spec(&self) -> &BlockSpec;

    /// `true` for Blocks that may request HITL suspension via `render`
    /// (§1, §4.1: "UI" vs "Processing").
    fn is_ui(&self) -> bool {
        false
    }

    /// Spec self-check (§4.1); default accepts, since most Blocks declare
    /// everything the Spec already constrains.
    async fn validate(&self) -> Result<(), RunnerError> {
        Ok(())
    }

    /// Produce a representative output conforming to the declared output
    /// schema, without side effects (§4.6). The Dry-run Engine prefers
    /// `dry_run.samples` from the Spec; Blocks that need smarter synthesis
    /// than the generic per-field minimal-value fallback override this.
    async fn dry_run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        Ok(default_dry_run_outputs(self.spec()))
    }

    /// Processing Blocks: execute for real given resolved inputs.
    async fn run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        Err(RunnerError::BlockInternal {
            block_id: self.spec().id.clone(),
            message: "block does not implement Run".to_string(),
        })
    }

    /// UI Blocks: render given resolved inputs and any previously-collected
    /// submission (`ui_outputs[node_id]` on resume, §4.7.6).
    async fn render(
        &self,
        _inputs: &BTreeMap<String, Value>,
        _prior_submission: Option<&Value>,
    ) -> Result<RenderOutcome, RunnerError> {
        Err(RunnerError::BlockInternal {
            block_id: self.spec().id.clone(),
            message: "block does not implement Render".to_string(),
        })
    }
}

/// Synthesize a minimal value per declared output type, used when a Block
/// has no `dry_run.samples` entry for a given output (§4.6).
pub fn default_dry_run_outputs(spec: &BlockSpec) -> BTreeMap<String, Value> {
    spec.outputs
        .iter()
        .map(|(name, field)| {
            let value = spec
                .dry_run
                .samples
                .get(name)
                .cloned()
                .unwrap_or_else(|| field.field_type.minimal_sample());
            (name.clone(), value)
        })
        .collect()
}

/// Discovers Block Specs and holds constructed Block instances, indexed by
/// `(id, version)`.
#[derive(Default)]
pub struct Registry {
    specs: DashMap<String, BTreeMap<Version, Arc<BlockSpec>>>,
    blocks: DashMap<String, BTreeMap<Version, Arc<dyn Block>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recursively enumerate Spec documents under `dir`, parsing and
    /// indexing each by `(id, version)`. Multiple specs sharing an `id` are
    /// kept side by side, indexed by version (§4.1).
    pub fn load_specs(&self, dir: &Path) -> Result<(), RunnerError> {
        for entry in walk_yaml_files(dir)? {
            let text = std::fs::read_to_string(&entry)?;
            let spec = BlockSpec::from_str(&text)?;
            self.insert_spec(spec)?;
        }
        Ok(())
    }

    fn insert_spec(&self, spec: BlockSpec) -> Result<(), RunnerError> {
        let version = Version::parse(&spec.version).map_err(|e| {
            RunnerError::SpecParseError(format!("invalid semver `{}`: {e}", spec.version))
        })?;
        let mut versions = self.specs.entry(spec.id.clone()).or_default();
        if versions.contains_key(&version) {
            return Err(RunnerError::DuplicateVersionError {
                id: spec.id.clone(),
                version: spec.version.clone(),
            });
        }
        versions.insert(version, Arc::new(spec));
        Ok(())
    }

    /// Register a constructed Block instance, making both its Spec and
    /// runnable implementation available to `get`/`list`.
    pub fn register_block(&self, block: Arc<dyn Block>) -> Result<(), RunnerError> {
        let spec = block.spec().clone();
        self.insert_spec(spec.clone())?;
        let version = Version::parse(&spec.version)
            .map_err(|e| RunnerError::SpecParseError(format!("invalid semver: {e}")))?;
        self.blocks.entry(spec.id.clone()).or_default().insert(version, block);
        Ok(())
    }

    /// Look up a Block Spec by id, selecting the highest semantic version
    /// when `version` is omitted.
    pub fn spec(&self, id: &str, version: Option<&str>) -> Result<Arc<BlockSpec>, RunnerError> {
        let versions = self
            .specs
            .get(id)
            .ok_or_else(|| RunnerError::RegistryBindingError(format!("no such block: {id}")))?;
        select_version(&versions, version)
            .ok_or_else(|| RunnerError::RegistryBindingError(format!("no matching version for block {id}")))
    }

    /// Look up a runnable Block instance by id (§4.1 `Get`).
    pub fn get(&self, id: &str, version: Option<&str>) -> Result<Arc<dyn Block>, RunnerError> {
        let versions = self
            .blocks
            .get(id)
            .ok_or_else(|| RunnerError::RegistryBindingError(format!("no such block: {id}")))?;
        select_version(&versions, version)
            .ok_or_else(|| RunnerError::RegistryBindingError(format!("no matching version for block {id}")))
    }

    /// Every `(id, version, spec)` known to the registry, for
    /// validator/introspection use (§4.1 `List`).
    pub fn list(&self) -> Vec<(String, String, Arc<BlockSpec>)> {
        let mut out = Vec::new();
        for entry in self.specs.iter() {
            let id = entry.key().clone();
            for (version, spec) in entry.value() {
                out.push((id.clone(), version.to_string(), spec.clone()));
            }
        }
        out
    }

    pub fn contains(&self, id: &str) -> bool {
        self.specs.contains_key(id)
    }
}

fn select_version<T: Clone>(versions: &BTreeMap<Version, T>, requested: Option<&str>) -> Option<T> {
    match requested {
        Some(v) => {
            let parsed = Version::parse(v).ok()?;
            versions.get(&parsed).cloned()
        }
        None => versions.iter().next_back().map(|(_, v)| v.clone()),
    }
}

fn walk_yaml_files(dir: &Path) -> Result<Vec<std::path::PathBuf>, RunnerError> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk_yaml_files(&path)?);
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        ) {
            out.push(path);
        }
    }
    Ok(out)
}
