//! End-to-end scenarios 3 and 4: `foreach` aggregation order and a
//! `while` loop bounded by `max_iterations`.

use std::sync::Arc;

use plan_runtime::config::ConfigStore;
use plan_runtime::registry::builtin;
use plan_runtime::registry::Registry;
use plan_runtime::{Plan, PlanRunner, RunOutcome, Value};

fn runner() -> (PlanRunner, tempfile::TempDir) {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    (PlanRunner::new(registry, config, dir.path().to_path_buf()), dir)
}

#[tokio::test]
async fn foreach_collects_in_input_order_regardless_of_completion_order() {
    let (runner, _dir) = runner();
    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
graph:
  - id: A
    block: constant
    in: { value: [1, 2, 3] }
    out: { value: v }
  - id: L
    type: loop
    foreach: { input: "${A.v}", item_var: it }
    body:
      plan:
        graph:
          - id: M
            block: double
            in: { x: "${vars.it}" }
            out: { y: r }
        exports:
          - { from: M.r, as: doubled }
    out: { collect: doubled }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    match runner.run(&plan, None, None).await.unwrap() {
        RunOutcome::Completed { outputs } => {
            assert_eq!(
                outputs["L"]["doubled"],
                Value::Array(vec![Value::from(2i64), Value::from(4i64), Value::from(6i64)])
            );
        }
        RunOutcome::Suspended { .. } => panic!("expected completion"),
    }
}

#[tokio::test]
async fn empty_foreach_input_runs_no_iterations_and_collects_empty_sequence() {
    let (runner, _dir) = runner();
    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
graph:
  - id: A
    block: constant
    in: { value: [] }
    out: { value: v }
  - id: L
    type: loop
    foreach: { input: "${A.v}", item_var: it }
    body:
      plan:
        graph:
          - id: M
            block: double
            in: { x: "${vars.it}" }
            out: { y: r }
        exports:
          - { from: M.r, as: doubled }
    out: { collect: doubled }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    match runner.run(&plan, None, None).await.unwrap() {
        RunOutcome::Completed { outputs } => {
            assert_eq!(outputs["L"]["doubled"], Value::Array(vec![]));
        }
        RunOutcome::Suspended { .. } => panic!("expected completion"),
    }
}

#[tokio::test]
async fn while_loop_runs_exactly_until_condition_flips_false() {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    let runner = PlanRunner::new(registry, config, dir.path().to_path_buf());

    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
graph:
  - id: W
    type: loop
    while: { condition: { expr: "${C.n} < 3" }, max_iterations: 10 }
    body:
      plan:
        graph:
          - id: C
            block: counter
            in: {}
            out: { n: n }
        exports:
          - { from: C.n, as: n }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    match runner.run(&plan, None, None).await.unwrap() {
        RunOutcome::Completed { .. } => {}
        RunOutcome::Suspended { .. } => panic!("expected completion"),
    }
}

#[tokio::test]
async fn while_loop_exceeding_max_iterations_is_a_halt_error() {
    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry).unwrap();
    let config = Arc::new(ConfigStore::empty());
    let dir = tempfile::tempdir().unwrap();
    let runner = PlanRunner::new(registry, config, dir.path().to_path_buf());

    // The guard never goes false (the body's counter output is never
    // inspected against an advancing variable), so the bound is hit.
    let yaml = r#"
api_version: v1
id: demo
version: 1.0.0
graph:
  - id: W
    type: loop
    while: { condition: { expr: "true" }, max_iterations: 2 }
    body:
      plan:
        graph:
          - id: C
            block: counter
            in: {}
            out: { n: n }
"#;
    let plan = Plan::from_str(yaml).unwrap();
    let err = runner.run(&plan, None, None).await.unwrap_err();
    assert_eq!(err.code(), "LOOP_BOUND_EXCEEDED");
}
