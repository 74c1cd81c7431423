//! End-to-end scenario 6: a flaky Block fails its first two attempts and
//! succeeds on the third, under a `retry` policy.

use std::sync::Arc;

use plan_runtime::config::ConfigStore;
use plan_runtime::registry::builtin::{self, FlakyBlock};
use plan_runtime::registry::Registry;
use plan_runtime::{Plan, PlanRunner, RunOutcome, Value};

#[tokio::test]
async fn retry_policy_retries_a_flaky_block_up_to_its_configured_limit() {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    registry.register_block(Arc::new(FlakyBlock::new(2))).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    let runner = PlanRunner::new(registry, config, dir.path().to_path_buf());

    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
policy:
  on_error: retry
  retries: 2
graph:
  - id: F
    block: flaky
    in: {}
    out: { ok: ok }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    match runner.run(&plan, None, None).await.unwrap() {
        RunOutcome::Completed { outputs } => assert_eq!(outputs["F"]["ok"], Value::from(true)),
        RunOutcome::Suspended { .. } => panic!("expected completion"),
    }
}

#[tokio::test]
async fn retry_exhaustion_surfaces_as_a_halt_error() {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    // Fails every attempt through attempt 5; policy only allows 2 retries
    // (3 total attempts), so exhaustion is reached before it ever succeeds.
    registry.register_block(Arc::new(FlakyBlock::new(5))).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    let runner = PlanRunner::new(registry, config, dir.path().to_path_buf());

    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
policy:
  on_error: retry
  retries: 2
graph:
  - id: F
    block: flaky
    in: {}
    out: { ok: ok }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    let err = runner.run(&plan, None, None).await.unwrap_err();
    assert_eq!(err.code(), "BLOCK_INTERNAL");
}

#[tokio::test]
async fn retries_zero_means_exactly_one_attempt() {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    registry.register_block(Arc::new(FlakyBlock::new(1))).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    let runner = PlanRunner::new(registry, config, dir.path().to_path_buf());

    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
policy:
  on_error: halt
  retries: 0
graph:
  - id: F
    block: flaky
    in: {}
    out: { ok: ok }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    let err = runner.run(&plan, None, None).await.unwrap_err();
    assert_eq!(err.code(), "BLOCK_INTERNAL");
}
