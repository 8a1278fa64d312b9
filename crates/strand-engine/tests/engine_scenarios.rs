//! End-to-end engine scenarios against the in-memory store

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use strand_engine::prelude::*;
use strand_engine::events::EventKind;
use strand_engine::maintenance;
use strand_engine::persistence::InstancePatch;

// ============================================================================
// Test executors
// ============================================================================

/// Returns its resolved config
struct Echo;

#[async_trait]
impl TaskExecutor for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        Ok(ctx.config)
    }
}

/// Returns its config and counts executions
struct CountingEcho {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskExecutor for CountingEcho {
    fn name(&self) -> &str {
        "counting_echo"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ctx.config)
    }
}

/// Fails with a retryable error until the configured attempt succeeds
struct Flaky {
    succeed_on: u32,
}

#[async_trait]
impl TaskExecutor for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        if ctx.attempt < self.succeed_on {
            Err(TaskError::retryable(format!(
                "transient failure on attempt {}",
                ctx.attempt
            )))
        } else {
            Ok(json!({"attempt": ctx.attempt}))
        }
    }
}

/// Sleeps for `duration_ms` without observing cancellation; the engine's
/// cooperative teardown drops the future
struct Slow;

#[async_trait]
impl TaskExecutor for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let millis = ctx
            .config
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(10_000);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!({"slept_ms": millis}))
    }
}

/// Tracks the peak number of concurrent executions
struct Gauge {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
}

#[async_trait]
impl TaskExecutor for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ctx.config)
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    engine: Engine,
    store: Arc<InMemoryStore>,
}

fn harness_with(
    executors: Vec<Arc<dyn TaskExecutor>>,
    configure: impl FnOnce(EngineConfig) -> EngineConfig,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let mut registry = ExecutorRegistry::new();
    registry
        .register_local(Arc::new(Echo))
        .expect("register echo");
    for executor in executors {
        registry.register_local(executor).expect("register executor");
    }

    let config = configure(
        EngineConfig::default()
            .with_engine_id("engine-test")
            .with_cancel_grace(Duration::from_millis(250)),
    );

    let engine = Engine::new(store.clone() as Arc<dyn WorkflowStore>, Arc::new(registry), config);
    Harness { engine, store }
}

fn harness() -> Harness {
    harness_with(vec![], |c| c)
}

async fn submit_and_run(h: &Harness, def: &WorkflowDefinition, inputs: Value) -> WorkflowInstance {
    h.engine.register_definition(def).await.expect("definition valid");
    let instance = h
        .engine
        .create_instance(&def.reference(), inputs, Default::default())
        .await
        .expect("instance created");
    h.engine
        .run_instance(instance.id)
        .await
        .expect("run completes")
}

fn node_row<'a>(rows: &'a [NodeInstance], node_id: &str, iteration: &str) -> &'a NodeInstance {
    rows.iter()
        .find(|r| r.node_id == node_id && r.iteration == iteration)
        .unwrap_or_else(|| panic!("missing node row {node_id}[{iteration}]"))
}

// ============================================================================
// Seed scenarios
// ============================================================================

#[tokio::test]
async fn test_linear_task_chain() {
    let h = harness();

    let def = WorkflowDefinition::new("linear", 1)
        .with_input(InputParameter::new("x", ParameterType::Number).required())
        .with_node(Node::task("a", "echo", json!({"x": "${inputs.x}"})))
        .with_node(Node::task("b", "echo", json!({"x": "${nodes.a.output.x}"})).with_depends_on(["a"]))
        .with_node(Node::task("c", "echo", json!({"x": "${nodes.b.output.x}"})).with_depends_on(["b"]))
        .with_output(OutputParameter::new("c", ParameterType::Object, "${nodes.c.output}"));

    let finished = submit_and_run(&h, &def, json!({"x": 1})).await;

    assert_eq!(finished.status, InstanceStatus::Completed);
    assert_eq!(finished.output_data, Some(json!({"c": {"x": 1}})));

    let rows = h.store.load_node_instances(finished.id).await.unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(node_row(&rows, id, "").status, NodeStatus::Completed);
    }
}

#[tokio::test]
async fn test_branch_selection() {
    let h = harness();

    let def = WorkflowDefinition::new("routed", 1)
        .with_node(Node::task("detect", "echo", json!({"route": "left"})))
        .with_node(
            Node::branch(
                "route",
                vec![BranchArm {
                    when: "${nodes.detect.output.route == \"left\"}".to_string(),
                    next_nodes: vec!["l".to_string()],
                }],
                vec!["r".to_string()],
            )
            .with_depends_on(["detect"]),
        )
        .with_node(Node::task("l", "echo", json!({"took": "left"})))
        .with_node(Node::task("r", "echo", json!({"took": "right"})));

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);

    let rows = h.store.load_node_instances(finished.id).await.unwrap();
    assert_eq!(node_row(&rows, "detect", "").status, NodeStatus::Completed);
    assert_eq!(node_row(&rows, "l", "").status, NodeStatus::Completed);
    assert_eq!(node_row(&rows, "r", "").status, NodeStatus::Skipped);
    assert_eq!(node_row(&rows, "route", "").status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_dynamic_parallel_loop_preserves_input_order() {
    let current = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let h = harness_with(
        vec![Arc::new(Gauge {
            current: current.clone(),
            peak: peak.clone(),
        })],
        |c| c,
    );

    let def = WorkflowDefinition::new("fanout", 1)
        .with_node(Node::task(
            "prep",
            "echo",
            json!({"groups": [{"g": 1}, {"g": 2}, {"g": 3}]}),
        ))
        .with_node(
            Node::for_each(
                "l",
                "${nodes.prep.output.groups}",
                Node::task("work", "gauge", json!({"g": "${item.g}"})),
            )
            .with_depends_on(["prep"])
            .with_max_concurrency(2)
            .with_error_handling(ErrorMode::Continue),
        );

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);

    let rows = h.store.load_node_instances(finished.id).await.unwrap();
    let loop_row = node_row(&rows, "l", "");
    assert_eq!(loop_row.status, NodeStatus::Completed);
    assert_eq!(
        loop_row.output,
        Some(json!({"results": [{"g": 1}, {"g": 2}, {"g": 3}]}))
    );

    // One attempt per expansion
    for i in 0..3 {
        let row = node_row(&rows, "work", &format!("l[{i}]"));
        assert_eq!(row.status, NodeStatus::Completed);
        assert_eq!(row.attempt, 1);
    }

    // The frame's cap bounds concurrent executions
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_retry_ladder() {
    let h = harness_with(vec![Arc::new(Flaky { succeed_on: 3 })], |c| c);

    let def = WorkflowDefinition::new("flaky-wf", 1).with_node(
        Node::task("work", "flaky", json!({}))
            .with_retry(
                RetrySpec::new(3)
                    .with_base_delay(Duration::from_millis(10))
                    .with_backoff_multiplier(2.0)
                    .with_jitter(0.0),
            ),
    );

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);

    let rows = h.store.load_node_instances(finished.id).await.unwrap();
    let row = node_row(&rows, "work", "");
    assert_eq!(row.status, NodeStatus::Completed);
    assert_eq!(row.attempt, 3);
    assert_eq!(row.output, Some(json!({"attempt": 3})));

    let events = h.store.list_events(finished.id).await.unwrap();
    let retries = events
        .iter()
        .filter(|e| e.kind == EventKind::NodeRetryScheduled)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_ownership_failover_without_duplicate_execution() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness_with(
        vec![Arc::new(CountingEcho {
            calls: calls.clone(),
        })],
        |c| c.with_stale_threshold(Duration::from_millis(20)),
    );

    let def = WorkflowDefinition::new("failover", 1)
        .with_node(Node::task("a", "counting_echo", json!({"step": "a"})))
        .with_node(Node::task("b", "counting_echo", json!({"step": "b"})).with_depends_on(["a"]))
        .with_node(Node::task("c", "counting_echo", json!({"step": "c"})).with_depends_on(["b"]));
    h.engine.register_definition(&def).await.unwrap();

    let instance = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();
    let id = instance.id;

    // Engine A picked up the instance, completed node `a`, then froze:
    // its heartbeats stop arriving
    let store: Arc<dyn WorkflowStore> = h.store.clone();
    store
        .acquire_lease(id, "engine-a", Duration::from_secs(60))
        .await
        .unwrap()
        .expect("lease free");
    store
        .update_instance_status(id, InstanceStatus::Running, InstancePatch::default())
        .await
        .unwrap();

    let mut row = NodeInstance::new(id, "a", "");
    row.status = NodeStatus::Completed;
    row.attempt = 1;
    row.output = Some(json!({"step": "a"}));
    store.upsert_node_instance(&row).await.unwrap();

    let mut scope = strand_engine::scope::ScopeArena::new(json!({}));
    let root = scope.root();
    scope.set_node_output(root, "a", json!({"step": "a"}));
    store
        .save_context(id, "engine-a", scope.to_json(), Some("a".to_string()))
        .await
        .unwrap();

    // The stale scan reclaims the instance to paused(owner_lost)
    tokio::time::sleep(Duration::from_millis(40)).await;
    let report = maintenance::sweep(&store, h.engine.config()).await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let reclaimed = store.load_instance(id).await.unwrap().unwrap();
    assert_eq!(reclaimed.status, InstanceStatus::Paused);

    // Engine B (this harness) takes over and finishes from node `b`
    let finished = h.engine.run_instance(id).await.unwrap();
    assert_eq!(finished.status, InstanceStatus::Completed);

    // `a` was not re-executed
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let rows = h.store.load_node_instances(id).await.unwrap();
    for node in ["a", "b", "c"] {
        assert_eq!(node_row(&rows, node, "").status, NodeStatus::Completed);
    }
}

#[tokio::test]
async fn test_cancel_during_parallel_join_all() {
    let h = harness_with(vec![Arc::new(Slow)], |c| c);

    let def = WorkflowDefinition::new("cancellable", 1)
        .with_node(Node::parallel(
            "p",
            vec![
                Node::task("s1", "slow", json!({"duration_ms": 10_000})),
                Node::task("s2", "slow", json!({"duration_ms": 10_000})),
                Node::task("s3", "slow", json!({"duration_ms": 10_000})),
            ],
        ))
        .with_node(Node::task("after", "echo", json!({})).with_depends_on(["p"]));
    h.engine.register_definition(&def).await.unwrap();

    let instance = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();
    let id = instance.id;

    let runner = h.engine.spawn_instance(id);

    // Wait until the parallel children are actually in flight
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rows = h.store.load_node_instances(id).await.unwrap();
        let running = rows
            .iter()
            .filter(|r| r.node_id == "s1" || r.node_id == "s2" || r.node_id == "s3")
            .filter(|r| r.status == NodeStatus::Running)
            .count();
        if running == 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "children never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    h.engine.cancel(id, "user requested").await.unwrap();

    let finished = runner.await.unwrap().unwrap();
    assert_eq!(finished.status, InstanceStatus::Cancelled);

    let rows = h.store.load_node_instances(id).await.unwrap();
    for (node, iteration) in [("s1", "p[0]"), ("s2", "p[1]"), ("s3", "p[2]")] {
        assert_eq!(
            node_row(&rows, node, iteration).status,
            NodeStatus::Cancelled,
            "{node} should be cancelled"
        );
    }

    // No successor was dispatched
    assert!(rows
        .iter()
        .filter(|r| r.node_id == "after")
        .all(|r| r.status != NodeStatus::Running && r.status != NodeStatus::Completed));
}

// ============================================================================
// Further behavior
// ============================================================================

#[tokio::test]
async fn test_static_loop_accumulates_indexed_results() {
    let h = harness();

    let def = WorkflowDefinition::new("looped", 1).with_node(Node::repeat(
        "iterate",
        3,
        vec![Node::task("step", "echo", json!({"i": "${index}"}))],
    ));

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);

    let rows = h.store.load_node_instances(finished.id).await.unwrap();
    let loop_row = node_row(&rows, "iterate", "");
    assert_eq!(
        loop_row.output,
        Some(json!({"results": [{"i": 0}, {"i": 1}, {"i": 2}]}))
    );
}

#[tokio::test]
async fn test_sub_workflow_surfaces_child_outputs() {
    let h = harness();

    let child = WorkflowDefinition::new("child", 1)
        .with_input(InputParameter::new("y", ParameterType::Number).required())
        .with_node(Node::task("double", "echo", json!({"doubled": "${inputs.y}"})))
        .with_output(OutputParameter::new(
            "result",
            ParameterType::Object,
            "${nodes.double.output}",
        ));
    h.engine.register_definition(&child).await.unwrap();

    let parent = WorkflowDefinition::new("parent", 1)
        .with_input(InputParameter::new("x", ParameterType::Number).required())
        .with_node(Node::sub_workflow(
            "sub",
            DefinitionRef::new("child", 1),
            json!({"y": "${inputs.x}"}),
        ))
        .with_output(OutputParameter::new(
            "from_child",
            ParameterType::Object,
            "${nodes.sub.output}",
        ));

    let finished = submit_and_run(&h, &parent, json!({"x": 9})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);
    assert_eq!(
        finished.output_data,
        Some(json!({"from_child": {"result": {"doubled": 9}}}))
    );
}

#[tokio::test]
async fn test_failure_shape_after_retries_exhaust() {
    let h = harness_with(vec![Arc::new(Flaky { succeed_on: 10 })], |c| c);

    let def = WorkflowDefinition::new("doomed", 1).with_node(
        Node::task("work", "flaky", json!({})).with_retry(
            RetrySpec::new(2)
                .with_base_delay(Duration::from_millis(5))
                .with_jitter(0.0),
        ),
    );

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Failed);

    let failure = finished.failure.expect("failure recorded");
    assert_eq!(failure.failed_node_id.as_deref(), Some("work"));
    assert_eq!(failure.failed_attempt, 2);
    assert_eq!(failure.kind, ErrorKind::Executor);
    assert!(failure.recoverable);
}

#[tokio::test]
async fn test_pause_and_resume_roundtrip() {
    let h = harness_with(vec![Arc::new(Slow)], |c| c);

    let def = WorkflowDefinition::new("pausable", 1)
        .with_node(Node::task("w1", "slow", json!({"duration_ms": 80})))
        .with_node(Node::task("w2", "echo", json!({"ok": true})).with_depends_on(["w1"]));
    h.engine.register_definition(&def).await.unwrap();

    let instance = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();
    let id = instance.id;

    let runner = h.engine.spawn_instance(id);

    // Pause while w1 is in flight
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rows = h.store.load_node_instances(id).await.unwrap();
        if rows.iter().any(|r| r.node_id == "w1" && r.status == NodeStatus::Running) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.engine.pause(id, "operator").await.unwrap();

    let suspended = runner.await.unwrap().unwrap();
    assert_eq!(suspended.status, InstanceStatus::Paused);

    // The in-flight unit finished and persisted before suspension
    let rows = h.store.load_node_instances(id).await.unwrap();
    assert_eq!(node_row(&rows, "w1", "").status, NodeStatus::Completed);

    // Resume is the identity on the remaining graph
    h.engine.resume(id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = h.store.load_instance(id).await.unwrap().unwrap();
        if current.status == InstanceStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "resume should complete");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let rows = h.store.load_node_instances(id).await.unwrap();
    assert_eq!(node_row(&rows, "w2", "").status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let h = harness();

    let def =
        WorkflowDefinition::new("cancel-twice", 1).with_node(Node::task("a", "echo", json!({})));
    h.engine.register_definition(&def).await.unwrap();

    let instance = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();

    let first = h.engine.cancel(instance.id, "first").await.unwrap();
    assert_eq!(first.status, InstanceStatus::Cancelled);

    // Cancelling again is a no-op returning success
    let second = h.engine.cancel(instance.id, "second").await.unwrap();
    assert_eq!(second.status, InstanceStatus::Cancelled);
}

#[tokio::test]
async fn test_unique_live_lease_invariant() {
    let h = harness_with(vec![Arc::new(Slow)], |c| c);

    let def = WorkflowDefinition::new("leased", 1)
        .with_node(Node::task("w", "slow", json!({"duration_ms": 150})));
    h.engine.register_definition(&def).await.unwrap();

    let instance = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();
    let id = instance.id;

    let runner = h.engine.spawn_instance(id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.store.get_lease(id).await.unwrap().is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second engine cannot run the instance while the lease is live
    let other = Engine::new(
        h.store.clone() as Arc<dyn WorkflowStore>,
        Arc::new(ExecutorRegistry::new()),
        EngineConfig::default().with_engine_id("engine-other"),
    );
    let result = other.run_instance(id).await;
    assert!(matches!(result, Err(EngineError::LeaseUnavailable(_))));

    let finished = runner.await.unwrap().unwrap();
    assert_eq!(finished.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_executor_not_found_fails_the_node() {
    let h = harness();

    let def = WorkflowDefinition::new("ghost", 1)
        .with_node(Node::task("a", "no_such_executor", json!({})));

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Failed);

    let failure = finished.failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::NotFound);
    assert!(!failure.recoverable);
}

#[tokio::test]
async fn test_timeout_counts_as_attempt_and_retries() {
    let h = harness_with(vec![Arc::new(Slow)], |c| c);

    let def = WorkflowDefinition::new("timed", 1).with_node(
        Node::task("w", "slow", json!({"duration_ms": 10_000}))
            .with_timeout(Duration::from_millis(30))
            .with_retry(
                RetrySpec::new(2)
                    .with_base_delay(Duration::from_millis(5))
                    .with_jitter(0.0),
            ),
    );

    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Failed);

    let failure = finished.failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.failed_attempt, 2);

    let events = h.store.list_events(finished.id).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::NodeRetryScheduled)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_missing_required_input_is_rejected() {
    let h = harness();

    let def = WorkflowDefinition::new("strict", 1)
        .with_input(InputParameter::new("x", ParameterType::Number).required())
        .with_node(Node::task("a", "echo", json!({})));
    h.engine.register_definition(&def).await.unwrap();

    let result = h
        .engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_terminal_absorption() {
    let h = harness();

    let def = WorkflowDefinition::new("absorbed", 1).with_node(Node::task("a", "echo", json!({})));
    let finished = submit_and_run(&h, &def, json!({})).await;
    assert_eq!(finished.status, InstanceStatus::Completed);

    // No transition leaves a terminal state
    let result = h.engine.pause(finished.id, "too late").await;
    assert!(matches!(
        result,
        Err(EngineError::Store(StoreError::InvalidTransition { .. }))
    ));

    let unchanged = h.store.load_instance(finished.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_get_returns_rollup() {
    let h = harness();
    let service = WorkflowService::new(h.engine.clone());

    let def = WorkflowDefinition::new("viewed", 1)
        .with_node(Node::task("a", "echo", json!({"v": 1})))
        .with_output(OutputParameter::new("a", ParameterType::Object, "${nodes.a.output}"));
    let finished = submit_and_run(&h, &def, json!({})).await;

    let view = service.get(finished.id).await.unwrap();
    assert_eq!(view.instance.status, InstanceStatus::Completed);
    assert_eq!(view.outputs, Some(json!({"a": {"v": 1}})));
    assert_eq!(view.nodes.len(), 1);

    let unknown = service.get(Uuid::now_v7()).await;
    assert!(matches!(unknown, Err(EngineError::InstanceNotFound(_))));
}
