//! A handful of reference Blocks used to exercise the Runner's scheduling,
//! retry, loop, and HITL machinery in this crate's own tests (§8's
//! end-to-end scenarios). Individual Block implementations are otherwise
//! out of scope for this crate (§1) — these exist purely as deterministic
//! engine fixtures, not business logic.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::errors::RunnerError;
use crate::registry::spec::{BlockSpec, DryRunSpec, FieldSchema, FieldType};
use crate::registry::{Block, RenderOutcome};
use crate::value::Value;

fn field(field_type: FieldType, required: bool) -> FieldSchema {
    FieldSchema {
        field_type,
        required,
        default: None,
        description: None,
        enum_values: Vec::new(),
        reference: None,
    }
}

/// Echoes its `value` input back out as `value`. Used by scenario 1/3 to
/// seed a graph with a literal.
pub struct ConstantBlock {
    spec: BlockSpec,
}

impl Default for ConstantBlock {
    fn default() -> Self {
        Self {
            spec: BlockSpec {
                id: "constant".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://constant".to_string(),
                inputs: BTreeMap::from([("value".to_string(), field(FieldType::Object, true))]),
                outputs: BTreeMap::from([("value".to_string(), field(FieldType::Object, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec::default(),
            },
        }
    }
}

#[async_trait]
impl Block for ConstantBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let value = inputs
            .get("value")
            .cloned()
            .ok_or_else(|| RunnerError::InputValidationFailed {
                block_id: self.spec.id.clone(),
                message: "missing required input `value`".to_string(),
            })?;
        Ok(BTreeMap::from([("value".to_string(), value)]))
    }

    async fn dry_run(&self, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        self.run(inputs).await
    }
}

/// Doubles a numeric `x` input, producing `y`.
pub struct DoubleBlock {
    spec: BlockSpec,
}

impl Default for DoubleBlock {
    fn default() -> Self {
        Self {
            spec: BlockSpec {
                id: "double".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://double".to_string(),
                inputs: BTreeMap::from([("x".to_string(), field(FieldType::Number, true))]),
                outputs: BTreeMap::from([("y".to_string(), field(FieldType::Number, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("y".to_string(), Value::from(0i64))]),
                },
            },
        }
    }
}

#[async_trait]
impl Block for DoubleBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let x = inputs
            .get("x")
            .and_then(Value::as_f64)
            .ok_or_else(|| RunnerError::InputValidationFailed {
                block_id: self.spec.id.clone(),
                message: "missing or non-numeric input `x`".to_string(),
            })?;
        Ok(BTreeMap::from([("y".to_string(), Value::from((x * 2.0) as i64))]))
    }
}

/// Stateful counter used by the `while`-loop scenario (§8 scenario 4):
/// each `Run` call increments an internal counter and emits it as `n`.
pub struct CounterBlock {
    spec: BlockSpec,
    count: AtomicU32,
}

impl Default for CounterBlock {
    fn default() -> Self {
        Self {
            spec: BlockSpec {
                id: "counter".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://counter".to_string(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::from([("n".to_string(), field(FieldType::Integer, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("n".to_string(), Value::from(0i64))]),
                },
            },
            count: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Block for CounterBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BTreeMap::from([("n".to_string(), Value::from(n as i64))]))
    }
}

/// Fails its first `fail_times` invocations with `BLOCK_INTERNAL`, then
/// succeeds — used by the retry-policy scenario (§8 scenario 6).
pub struct FlakyBlock {
    spec: BlockSpec,
    fail_times: u32,
    attempts: AtomicU32,
}

impl FlakyBlock {
    pub fn new(fail_times: u32) -> Self {
        Self {
            spec: BlockSpec {
                id: "flaky".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://flaky".to_string(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::from([("ok".to_string(), field(FieldType::Boolean, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("ok".to_string(), Value::from(true))]),
                },
            },
            fail_times,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Block for FlakyBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            return Err(RunnerError::BlockInternal {
                block_id: self.spec.id.clone(),
                message: format!("simulated failure on attempt {attempt}"),
            });
        }
        Ok(BTreeMap::from([("ok".to_string(), Value::from(true))]))
    }
}

/// Records how many concurrent `run` calls are in flight against itself,
/// used to assert that `run_block_batch` never exceeds
/// `policy.concurrency.default_max_workers` (§4.7.1, §8 "bounded
/// parallelism"). `current` tracks live calls; `high_water` latches the
/// largest value `current` ever reached.
pub struct ConcurrencyProbeBlock {
    spec: BlockSpec,
    current: Arc<AtomicUsize>,
    high_water: Arc<AtomicUsize>,
    hold_ms: u64,
}

impl ConcurrencyProbeBlock {
    pub fn new(current: Arc<AtomicUsize>, high_water: Arc<AtomicUsize>, hold_ms: u64) -> Self {
        Self {
            spec: BlockSpec {
                id: "concurrency_probe".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://concurrency_probe".to_string(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::from([("ok".to_string(), field(FieldType::Boolean, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("ok".to_string(), Value::from(true))]),
                },
            },
            current,
            high_water,
            hold_ms,
        }
    }
}

#[async_trait]
impl Block for ConcurrencyProbeBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(self.hold_ms)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(BTreeMap::from([("ok".to_string(), Value::from(true))]))
    }
}

/// Sleeps for `delay_ms` before completing, incrementing `finished`
/// afterward so a test can observe whether a timed-out or cancelled Block's
/// orphaned task was allowed to run to completion in the background rather
/// than being aborted outright (§4.7.1, §5).
pub struct SlowBlock {
    spec: BlockSpec,
    delay_ms: u64,
    finished: Arc<AtomicUsize>,
}

impl SlowBlock {
    pub fn new(delay_ms: u64, finished: Arc<AtomicUsize>) -> Self {
        Self {
            spec: BlockSpec {
                id: "slow".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://slow".to_string(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::from([("ok".to_string(), field(FieldType::Boolean, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("ok".to_string(), Value::from(true))]),
                },
            },
            delay_ms,
            finished,
        }
    }
}

#[async_trait]
impl Block for SlowBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, _inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeMap::from([("ok".to_string(), Value::from(true))]))
    }
}

/// Fails immediately when its resolved `index` input equals `fail_on`;
/// otherwise sleeps `delay_ms` before succeeding. `started`/`finished`
/// let a test observe whether a sibling foreach iteration's sleep was cut
/// short by a `halt`-policy cancellation from another iteration (§4.7.4).
pub struct IndexGatedBlock {
    spec: BlockSpec,
    fail_on: i64,
    delay_ms: u64,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl IndexGatedBlock {
    pub fn new(fail_on: i64, delay_ms: u64, started: Arc<AtomicUsize>, finished: Arc<AtomicUsize>) -> Self {
        Self {
            spec: BlockSpec {
                id: "index_gated".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://index_gated".to_string(),
                inputs: BTreeMap::from([("index".to_string(), field(FieldType::Integer, true))]),
                outputs: BTreeMap::from([("ok".to_string(), field(FieldType::Boolean, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([("ok".to_string(), Value::from(true))]),
                },
            },
            fail_on,
            delay_ms,
            started,
            finished,
        }
    }
}

#[async_trait]
impl Block for IndexGatedBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    async fn run(&self, inputs: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RunnerError> {
        let index = inputs.get("index").and_then(Value::as_f64).unwrap_or(-1.0) as i64;
        if index == self.fail_on {
            return Err(RunnerError::BlockInternal {
                block_id: self.spec.id.clone(),
                message: format!("simulated failure at index {index}"),
            });
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(BTreeMap::from([("ok".to_string(), Value::from(true))]))
    }
}

/// A UI Block that always requests suspension on its first `render` call,
/// then returns the caller-supplied submission as `collected` on resume
/// (§8 scenario 5, §4.7.6).
pub struct InteractiveInputBlock {
    spec: BlockSpec,
}

impl Default for InteractiveInputBlock {
    fn default() -> Self {
        Self {
            spec: BlockSpec {
                id: "interactive_input".to_string(),
                version: "1.0.0".to_string(),
                entrypoint: "builtin://interactive_input".to_string(),
                inputs: BTreeMap::new(),
                outputs: BTreeMap::from([("collected".to_string(), field(FieldType::Object, false))]),
                requirements: Vec::new(),
                dry_run: DryRunSpec {
                    samples: BTreeMap::from([(
                        "collected".to_string(),
                        Value::Object(BTreeMap::new()),
                    )]),
                },
            },
        }
    }
}

#[async_trait]
impl Block for InteractiveInputBlock {
    fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    fn is_ui(&self) -> bool {
        true
    }

    async fn render(
        &self,
        _inputs: &BTreeMap<String, Value>,
        prior_submission: Option<&Value>,
    ) -> Result<RenderOutcome, RunnerError> {
        match prior_submission {
            Some(submission) => Ok(RenderOutcome::Ready(BTreeMap::from([(
                "collected".to_string(),
                submission.clone(),
            )]))),
            None => Ok(RenderOutcome::AwaitUi { snapshot: None }),
        }
    }
}

/// Registers every builtin reference Block into `registry`. Intended for
/// tests and demos, not production hosts (which supply their own Blocks
/// via `entrypoint`-driven construction, §4.1).
pub fn register_all(registry: &crate::registry::Registry) -> Result<(), RunnerError> {
    registry.register_block(std::sync::Arc::new(ConstantBlock::default()))?;
    registry.register_block(std::sync::Arc::new(DoubleBlock::default()))?;
    registry.register_block(std::sync::Arc::new(CounterBlock::default()))?;
    registry.register_block(std::sync::Arc::new(InteractiveInputBlock::default()))?;
    Ok(())
}
