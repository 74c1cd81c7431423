//! Error types for the plan runtime.
//!
//! This module defines a unified error enumeration used across Plan loading,
//! static validation, reference resolution, guard evaluation, dry-running,
//! and scheduling. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - [`RunnerError::code`] maps every variant onto exactly one of the
//!   `error` event `code` values, so the mapping from a caught Rust error to
//!   an emitted evidence event is mechanical rather than duplicated per call
//!   site.
//! - [`RunnerError::recoverable`] reports whether the caller may resume the
//!   Run that raised this error, or must start a new one.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the plan runtime.
///
/// - Used across validation, reference resolution, dry-run, and execution.
/// - Implements `std::error::Error` via `thiserror`.
pub enum RunnerError {
    /// The Plan document itself could not be parsed as YAML/JSON.
    #[error("failed to parse plan document: {0}")]
    PlanParseError(String),

    /// A Block Spec document could not be parsed.
    #[error("failed to parse block spec: {0}")]
    SpecParseError(String),

    /// Two Block Specs declared the same `id@version`.
    #[error("duplicate block spec: {id}@{version}")]
    DuplicateVersionError { id: String, version: String },

    /// Static validation found one or more problems; all are reported
    /// together rather than failing at the first.
    #[error("plan validation failed with {} issue(s): {}", .messages.len(), .messages.join("; "))]
    ValidationError { messages: Vec<String> },

    /// A Block rejected its inputs.
    #[error("block `{block_id}` rejected its inputs: {message}")]
    InputValidationFailed { block_id: String, message: String },

    /// A Block returned values incompatible with its declared output schema.
    #[error("block `{block_id}` produced outputs incompatible with its schema: {message}")]
    OutputSchemaMismatch { block_id: String, message: String },

    /// A `${...}` placeholder could not be resolved at run time.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// The dependency graph contains a cycle (validation-time only).
    #[error("cycle detected among nodes: {0:?}")]
    CycleDetected(Vec<String>),

    /// A guard expression is outside the closed grammar.
    #[error("unsafe or malformed guard expression: {0}")]
    UnsafeExpression(String),

    /// A `while` loop exceeded `max_iterations`.
    #[error("loop `{node_id}` exceeded max_iterations ({max_iterations})")]
    LoopBoundExceeded { node_id: String, max_iterations: u64 },

    /// The child Plan referenced by a subflow node cannot be located.
    #[error("subflow plan not found: {0}")]
    SubflowNotFound(String),

    /// A node exceeded its per-attempt timeout.
    #[error("node `{0}` timed out")]
    Timeout(String),

    /// A dependency produced no outputs (continue-policy skip upstream).
    #[error("dependency `{0}` produced no outputs")]
    DependencyFailed(String),

    /// `${config.X}` could not be resolved.
    #[error("config key missing: {0}")]
    ConfigKeyMissing(String),

    /// `${env.X}` could not be resolved.
    #[error("environment key missing: {0}")]
    EnvKeyMissing(String),

    /// The referenced Block id (or input/output alias) does not exist in
    /// the Registry.
    #[error("{0}")]
    RegistryBindingError(String),

    /// A Block raised an error that does not fit any other taxonomy entry.
    #[error("block `{block_id}` internal error: {message}")]
    BlockInternal { block_id: String, message: String },

    /// I/O error from the event log, state snapshot, or spec loader.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// JSON (de)serialization error, e.g. reading/writing state snapshots.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML (de)serialization error, e.g. loading a Plan or Block Spec.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl RunnerError {
    /// The `code` value attached to the `error` event emitted for this
    /// failure (§7 of the specification).
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::InputValidationFailed { .. } => "INPUT_VALIDATION_FAILED",
            RunnerError::OutputSchemaMismatch { .. } => "OUTPUT_SCHEMA_MISMATCH",
            RunnerError::UnresolvedReference(_) => "UNRESOLVED_REFERENCE",
            RunnerError::CycleDetected(_) => "CYCLE_DETECTED",
            RunnerError::UnsafeExpression(_) => "UNSAFE_EXPRESSION",
            RunnerError::LoopBoundExceeded { .. } => "LOOP_BOUND_EXCEEDED",
            RunnerError::SubflowNotFound(_) => "SUBFLOW_NOT_FOUND",
            RunnerError::Timeout(_) => "TIMEOUT",
            RunnerError::DependencyFailed(_) => "DEPENDENCY_FAILED",
            RunnerError::ConfigKeyMissing(_) => "CONFIG_KEY_MISSING",
            RunnerError::EnvKeyMissing(_) => "ENV_KEY_MISSING",
            RunnerError::BlockInternal { .. } => "BLOCK_INTERNAL",
            RunnerError::PlanParseError(_)
            | RunnerError::SpecParseError(_)
            | RunnerError::DuplicateVersionError { .. }
            | RunnerError::ValidationError { .. }
            | RunnerError::RegistryBindingError(_) => "INPUT_VALIDATION_FAILED",
            RunnerError::IOError(_) | RunnerError::JsonError(_) | RunnerError::YamlError(_) => {
                "BLOCK_INTERNAL"
            }
            RunnerError::CustomError(_) => "BLOCK_INTERNAL",
        }
    }

    /// Whether the Run that raised this error may be resumed after the
    /// caller corrects the underlying condition, or must be restarted from
    /// scratch. Transient errors (timeout, external I/O) are recoverable;
    /// structural errors (cycle, schema) are not.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            RunnerError::Timeout(_)
                | RunnerError::IOError(_)
                | RunnerError::BlockInternal { .. }
                | RunnerError::DependencyFailed(_)
        )
    }
}
