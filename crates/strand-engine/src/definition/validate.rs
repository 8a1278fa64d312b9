//! Definition and input validation

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};

use super::{Node, NodeKind, WorkflowDefinition};

/// Errors surfaced at submission time; never retried
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("definition has no nodes")]
    EmptyDefinition,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("node {node} depends on unknown node {dependency}")]
    UnknownDependency { node: String, dependency: String },

    #[error("branch {node} targets unknown node {target}")]
    UnknownBranchTarget { node: String, target: String },

    #[error("dependency cycle involving node {0}")]
    DependencyCycle(String),

    #[error("loop {node} is invalid: {reason}")]
    InvalidLoop { node: String, reason: String },

    #[error("parallel {node} child {child} must not declare depends_on")]
    ParallelChildDependency { node: String, child: String },

    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("input {name} has wrong type (expected {expected})")]
    InputType { name: String, expected: String },

    #[error("definition {0} is not active")]
    InactiveDefinition(String),

    #[error("executor config rejected: {0}")]
    ExecutorConfig(String),
}

/// Validate the structural invariants of a definition
///
/// Checks id uniqueness (inline nodes included), edge targets, branch
/// targets, loop shapes, and acyclicity of the `depends_on` graph.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.nodes.is_empty() {
        return Err(ValidationError::EmptyDefinition);
    }

    let mut seen = HashSet::new();
    for node in &def.nodes {
        collect_ids(node, &mut seen)?;
    }

    let top_level: HashSet<&str> = def.nodes.iter().map(|n| n.id.as_str()).collect();

    for node in &def.nodes {
        for dep in &node.depends_on {
            if !top_level.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        check_kind(node, &top_level)?;
    }

    check_acyclic(&def.nodes)?;
    Ok(())
}

fn collect_ids<'a>(node: &'a Node, seen: &mut HashSet<&'a str>) -> Result<(), ValidationError> {
    if !seen.insert(node.id.as_str()) {
        return Err(ValidationError::DuplicateNodeId(node.id.clone()));
    }

    match &node.kind {
        NodeKind::Parallel { nodes, .. } | NodeKind::Loop { nodes, .. } => {
            for child in nodes {
                collect_ids(child, seen)?;
            }
        }
        NodeKind::ForEach { task_template, .. } => {
            collect_ids(task_template, seen)?;
        }
        _ => {}
    }

    Ok(())
}

fn check_kind(node: &Node, top_level: &HashSet<&str>) -> Result<(), ValidationError> {
    match &node.kind {
        NodeKind::Branch { arms, else_nodes } => {
            for target in arms.iter().flat_map(|a| &a.next_nodes).chain(else_nodes) {
                if !top_level.contains(target.as_str()) {
                    return Err(ValidationError::UnknownBranchTarget {
                        node: node.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        NodeKind::Parallel { nodes, .. } => {
            if nodes.is_empty() {
                return Err(ValidationError::InvalidLoop {
                    node: node.id.clone(),
                    reason: "parallel body is empty".to_string(),
                });
            }
            // Inline parallel children are independent siblings
            for child in nodes {
                if !child.depends_on.is_empty() {
                    return Err(ValidationError::ParallelChildDependency {
                        node: node.id.clone(),
                        child: child.id.clone(),
                    });
                }
            }
        }
        NodeKind::Loop {
            iterations, nodes, ..
        } => {
            if *iterations == 0 {
                return Err(ValidationError::InvalidLoop {
                    node: node.id.clone(),
                    reason: "iterations must be > 0".to_string(),
                });
            }
            if nodes.is_empty() {
                return Err(ValidationError::InvalidLoop {
                    node: node.id.clone(),
                    reason: "loop body is empty".to_string(),
                });
            }
            let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
            for child in nodes {
                for dep in &child.depends_on {
                    if !ids.contains(dep.as_str()) {
                        return Err(ValidationError::UnknownDependency {
                            node: child.id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
            check_acyclic(nodes)?;
        }
        NodeKind::ForEach { task_template, .. } => {
            if !task_template.depends_on.is_empty() {
                return Err(ValidationError::ParallelChildDependency {
                    node: node.id.clone(),
                    child: task_template.id.clone(),
                });
            }
        }
        NodeKind::Task { .. } | NodeKind::SubWorkflow { .. } => {}
    }

    Ok(())
}

/// Kahn's algorithm over the depends_on edges
fn check_acyclic(nodes: &[Node]) -> Result<(), ValidationError> {
    let mut indegree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        for dep in &node.depends_on {
            *indegree.get_mut(node.id.as_str()).expect("id present") += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = indegree.get_mut(dependent).expect("id present");
            *d -= 1;
            if *d == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if visited != nodes.len() {
        let stuck = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(id, _)| id.to_string())
            .unwrap_or_default();
        return Err(ValidationError::DependencyCycle(stuck));
    }

    Ok(())
}

/// Validate caller inputs against the definition's schema and apply defaults
///
/// Returns the effective input object seeded into the instance scope.
pub fn resolve_inputs(
    def: &WorkflowDefinition,
    inputs: &Value,
) -> Result<Value, ValidationError> {
    let provided = inputs.as_object().cloned().unwrap_or_default();
    let mut effective = Map::new();

    for param in &def.inputs {
        match provided.get(&param.name) {
            Some(value) if !value.is_null() => {
                if !param.param_type.matches(value) {
                    return Err(ValidationError::InputType {
                        name: param.name.clone(),
                        expected: format!("{:?}", param.param_type).to_lowercase(),
                    });
                }
                effective.insert(param.name.clone(), value.clone());
            }
            _ => {
                if let Some(default) = &param.default {
                    effective.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(ValidationError::MissingInput(param.name.clone()));
                }
            }
        }
    }

    // Pass through extra keys the schema does not mention
    for (key, value) in provided {
        effective.entry(key).or_insert(value);
    }

    Ok(Value::Object(effective))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{InputParameter, ParameterType};
    use serde_json::json;

    fn linear_def() -> WorkflowDefinition {
        WorkflowDefinition::new("linear", 1)
            .with_node(Node::task("a", "echo", json!({})))
            .with_node(Node::task("b", "echo", json!({})).with_depends_on(["a"]))
            .with_node(Node::task("c", "echo", json!({})).with_depends_on(["b"]))
    }

    #[test]
    fn test_valid_linear_chain() {
        assert!(validate_definition(&linear_def()).is_ok());
    }

    #[test]
    fn test_empty_definition() {
        let def = WorkflowDefinition::new("empty", 1);
        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::EmptyDefinition)
        ));
    }

    #[test]
    fn test_duplicate_node_id() {
        let def = WorkflowDefinition::new("dup", 1)
            .with_node(Node::task("a", "echo", json!({})))
            .with_node(Node::task("a", "echo", json!({})));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::DuplicateNodeId(_))
        ));
    }

    #[test]
    fn test_duplicate_inline_node_id() {
        let def = WorkflowDefinition::new("dup-inline", 1)
            .with_node(Node::task("a", "echo", json!({})))
            .with_node(Node::parallel(
                "p",
                vec![Node::task("a", "echo", json!({}))],
            ));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::DuplicateNodeId(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let def = WorkflowDefinition::new("bad-dep", 1)
            .with_node(Node::task("a", "echo", json!({})).with_depends_on(["ghost"]));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let def = WorkflowDefinition::new("cycle", 1)
            .with_node(Node::task("a", "echo", json!({})).with_depends_on(["b"]))
            .with_node(Node::task("b", "echo", json!({})).with_depends_on(["a"]));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_branch_target_must_exist() {
        let def = WorkflowDefinition::new("branch", 1).with_node(Node::branch(
            "route",
            vec![crate::definition::BranchArm {
                when: "${inputs.flag}".to_string(),
                next_nodes: vec!["ghost".to_string()],
            }],
            vec![],
        ));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::UnknownBranchTarget { .. })
        ));
    }

    #[test]
    fn test_parallel_child_with_deps_rejected() {
        let def = WorkflowDefinition::new("par", 1).with_node(Node::parallel(
            "p",
            vec![Node::task("x", "echo", json!({})).with_depends_on(["y"])],
        ));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::ParallelChildDependency { .. })
        ));
    }

    #[test]
    fn test_zero_iteration_loop_rejected() {
        let def = WorkflowDefinition::new("loop", 1).with_node(Node::repeat(
            "l",
            0,
            vec![Node::task("x", "echo", json!({}))],
        ));

        assert!(matches!(
            validate_definition(&def),
            Err(ValidationError::InvalidLoop { .. })
        ));
    }

    #[test]
    fn test_resolve_inputs_defaults_and_required() {
        let def = WorkflowDefinition::new("inputs", 1)
            .with_node(Node::task("a", "echo", json!({})))
            .with_input(InputParameter::new("x", ParameterType::Number).required())
            .with_input(
                InputParameter::new("mode", ParameterType::String)
                    .with_default(json!("fast")),
            );

        let effective = resolve_inputs(&def, &json!({"x": 1})).unwrap();
        assert_eq!(effective, json!({"x": 1, "mode": "fast"}));

        let missing = resolve_inputs(&def, &json!({}));
        assert!(matches!(missing, Err(ValidationError::MissingInput(_))));

        let wrong = resolve_inputs(&def, &json!({"x": "one"}));
        assert!(matches!(wrong, Err(ValidationError::InputType { .. })));
    }
}
