//! Execution Context (§3, §5): the mutable state owned by a single Run.
//!
//! Holds resolved node outputs, UI outputs (kept separately so a resumed
//! Run can replay them without re-rendering), the at-most-one pending UI
//! wait, variable overrides, and a cooperative cancellation handle. The
//! Runner is the only writer; Blocks receive immutable snapshots (§5
//! "Shared resources") — every mutation below goes through `&mut self`
//! methods the Runner calls from its own single-threaded scheduling loop
//! (parallel Processing work computes its result off to the side and
//! reports back for the Runner to fold in, rather than mutating directly).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::value::Value;

/// A snapshot of a suspended UI wait (§3, §4.7.6): which node is waiting,
/// the inputs it was rendered with, and when the wait began.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUi {
    pub node_id: String,
    pub input_snapshot: BTreeMap<String, Value>,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// Cooperative cancellation handle shared between the Runner and any
/// in-flight node attempts (§5 "Cancellation semantics"). A hand-rolled
/// `Arc<AtomicBool>` + `Notify` rather than a `tokio-util` CancellationToken
/// — the teacher does not depend on `tokio-util` in its main dependency
/// line, and §5 only asks for a simple cooperative checkpoint.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Mutable state owned by a single Run (§3). Created on run start,
/// destroyed on finish, or persisted via [`crate::hitl`] if suspended.
pub struct ExecutionContext {
    pub plan_id: String,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    /// `node_id -> alias -> value`.
    pub outputs: BTreeMap<String, BTreeMap<String, Value>>,
    /// `node_id -> submitted value`, kept separate from `outputs` so a
    /// resumed Run can replay a UI Block's submission without re-rendering.
    pub ui_outputs: BTreeMap<String, Value>,
    /// At most one per level of recursion (§4.7.6).
    pub pending_ui: Option<PendingUi>,
    /// Node ids that have completed successfully (used by the state
    /// snapshot's `success_nodes` and by resume to skip already-done work).
    pub success_nodes: Vec<String>,
    /// Node ids skipped by a `when`/guard evaluating falsy.
    pub skipped_nodes: Vec<String>,
    /// Node ids whose Block attempt(s) failed under `on_error: continue`
    /// (§4.7.3). Tracked separately from `skipped_nodes` so `finish_summary`
    /// can distinguish a guard skip from a swallowed failure (§6).
    pub errored_nodes: Vec<String>,
    /// Sum of retried attempts (`attempts - 1`) across every node that has
    /// completed or failed so far, for `finish_summary.total_retries` (§6,
    /// scenario 6 in §8).
    pub total_retries: u64,
    pub vars_overrides: BTreeMap<String, Value>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(plan_id: impl Into<String>, run_id: impl Into<String>, vars_overrides: BTreeMap<String, Value>) -> Self {
        Self {
            plan_id: plan_id.into(),
            run_id: run_id.into(),
            parent_run_id: None,
            outputs: BTreeMap::new(),
            ui_outputs: BTreeMap::new(),
            pending_ui: None,
            success_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            errored_nodes: Vec::new(),
            total_retries: 0,
            vars_overrides,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn record_output(&mut self, node_id: &str, outputs: BTreeMap<String, Value>) {
        self.outputs.insert(node_id.to_string(), outputs);
        self.success_nodes.push(node_id.to_string());
    }

    pub fn record_skip(&mut self, node_id: &str) {
        self.skipped_nodes.push(node_id.to_string());
    }

    /// Records a Block node whose attempt(s) failed but whose Plan policy is
    /// `continue` (§4.7.3), so scheduling treats it as done without
    /// propagating the error.
    pub fn record_error(&mut self, node_id: &str) {
        self.errored_nodes.push(node_id.to_string());
    }

    pub fn add_retries(&mut self, attempts: u32) {
        self.total_retries += attempts.saturating_sub(1) as u64;
    }

    pub fn has_run(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
            || self.skipped_nodes.iter().any(|n| n == node_id)
            || self.errored_nodes.iter().any(|n| n == node_id)
    }
}
