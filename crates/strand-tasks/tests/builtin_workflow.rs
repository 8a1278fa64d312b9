//! Built-in executors driven through the engine's foreign-scope registry

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strand_engine::prelude::*;
use strand_tasks::register_builtin;

fn engine() -> Engine {
    let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryStore::new());
    let mut registry = ExecutorRegistry::new();
    register_builtin(&mut registry).expect("builtin scope registers");
    registry.seal();

    Engine::new(
        store,
        Arc::new(registry),
        EngineConfig::default().with_engine_id("engine-tasks-test"),
    )
}

#[tokio::test]
async fn test_workflow_over_builtin_executors() {
    let engine = engine();

    let def = WorkflowDefinition::new("builtin-chain", 1)
        .with_input(InputParameter::new("n", ParameterType::Number).required())
        .with_node(Node::task("seed", "echo", json!({"n": "${inputs.n}"})))
        .with_node(
            Node::task(
                "shape",
                "transform",
                json!({"value": "${nodes.seed.output.n}", "wrap": "count"}),
            )
            .with_depends_on(["seed"]),
        )
        .with_node(
            Node::task("pace", "delay", json!({"duration_ms": 5})).with_depends_on(["shape"]),
        )
        .with_output(OutputParameter::new(
            "shaped",
            ParameterType::Object,
            "${nodes.shape.output}",
        ));

    engine.register_definition(&def).await.unwrap();
    let instance = engine
        .create_instance(&def.reference(), json!({"n": 4}), Default::default())
        .await
        .unwrap();

    let finished = engine.run_instance(instance.id).await.unwrap();

    assert_eq!(finished.status, InstanceStatus::Completed);
    assert_eq!(finished.output_data, Some(json!({"shaped": {"count": 4}})));
}

#[tokio::test]
async fn test_delay_respects_node_timeout() {
    let engine = engine();

    let def = WorkflowDefinition::new("slow-delay", 1).with_node(
        Node::task("pace", "delay", json!({"duration_ms": 60_000}))
            .with_timeout(Duration::from_millis(20)),
    );

    engine.register_definition(&def).await.unwrap();
    let instance = engine
        .create_instance(&def.reference(), json!({}), Default::default())
        .await
        .unwrap();

    let finished = engine.run_instance(instance.id).await.unwrap();

    assert_eq!(finished.status, InstanceStatus::Failed);
    let failure = finished.failure.expect("failure recorded");
    assert_eq!(failure.kind, ErrorKind::Timeout);
}
