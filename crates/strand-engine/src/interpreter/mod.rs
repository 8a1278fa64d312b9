//! Graph interpretation
//!
//! Pure node-graph semantics, kept separate from the async dispatcher so
//! they can be tested without a runtime: readiness over `depends_on`
//! edges, skip propagation, branch-arm selection, dependency-depth
//! ordering, and iteration keys for loop/parallel expansions.

use std::collections::HashMap;

use crate::definition::{BranchArm, Node, NodeKind};
use crate::persistence::NodeStatus;
use crate::scope::{FrameId, ScopeArena};
use crate::template::{evaluate_condition, TemplateError};

/// Per-level tracking of node statuses
///
/// Branch targets carry an implicit dependency on their branch node, so a
/// target only becomes ready once the branch has selected it (unselected
/// targets are marked skipped by the dispatcher when the selection lands).
#[derive(Debug)]
pub struct NodeTracker {
    statuses: HashMap<String, NodeStatus>,

    /// target node id -> gating branch node id
    gates: HashMap<String, String>,
}

impl NodeTracker {
    /// Create a tracker with every node waiting
    pub fn new(nodes: &[Node]) -> Self {
        let statuses = nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Waiting))
            .collect();

        let mut gates = HashMap::new();
        for node in nodes {
            if let NodeKind::Branch { arms, else_nodes } = &node.kind {
                for target in arms.iter().flat_map(|a| &a.next_nodes).chain(else_nodes) {
                    gates.insert(target.clone(), node.id.clone());
                }
            }
        }

        Self { statuses, gates }
    }

    /// Restore a persisted status (crash recovery)
    ///
    /// Only terminal statuses are restored; a node that was mid-flight when
    /// the previous owner died goes back to waiting and re-runs.
    pub fn restore(&mut self, node_id: &str, status: NodeStatus) {
        if status.is_terminal() {
            self.statuses.insert(node_id.to_string(), status);
        }
    }

    pub fn set(&mut self, node_id: &str, status: NodeStatus) {
        self.statuses.insert(node_id.to_string(), status);
    }

    pub fn get(&self, node_id: &str) -> NodeStatus {
        self.statuses
            .get(node_id)
            .copied()
            .unwrap_or(NodeStatus::Waiting)
    }

    /// Effective dependencies: declared edges plus the gating branch
    fn dependencies<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a str> {
        node.depends_on
            .iter()
            .map(|s| s.as_str())
            .chain(self.gates.get(&node.id).map(|s| s.as_str()))
    }

    /// Whether every node is terminal
    pub fn all_terminal(&self, nodes: &[Node]) -> bool {
        nodes.iter().all(|n| self.get(&n.id).is_terminal())
    }

    /// Nodes that are ready to dispatch
    ///
    /// A node is ready when it is waiting, every dependency is completed
    /// or skipped, and not all dependencies are skipped. A failed or
    /// cancelled dependency never releases its dependents; the level's
    /// failure handling tears the graph down instead.
    pub fn ready(&self, nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| self.get(&n.id) == NodeStatus::Waiting)
            .filter(|n| {
                let deps: Vec<NodeStatus> =
                    self.dependencies(n).map(|d| self.get(d)).collect();
                deps.iter()
                    .all(|s| matches!(s, NodeStatus::Completed | NodeStatus::Skipped))
                    && !(!deps.is_empty() && deps.iter().all(|s| *s == NodeStatus::Skipped))
            })
            .map(|n| n.id.clone())
            .collect()
    }

    /// Waiting nodes whose every dependency is skipped
    pub fn newly_skippable(&self, nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter(|n| self.get(&n.id) == NodeStatus::Waiting)
            .filter(|n| {
                let deps: Vec<NodeStatus> =
                    self.dependencies(n).map(|d| self.get(d)).collect();
                !deps.is_empty() && deps.iter().all(|s| *s == NodeStatus::Skipped)
            })
            .map(|n| n.id.clone())
            .collect()
    }
}

/// Dependency depth of every node (longest path from a root)
///
/// Used for ready-queue priority: shallower nodes dispatch first, ties
/// break by definition order. The graph is validated acyclic before this
/// runs.
pub fn depth_map(nodes: &[Node]) -> HashMap<String, usize> {
    fn depth_of(
        id: &str,
        deps: &HashMap<&str, Vec<&str>>,
        memo: &mut HashMap<String, usize>,
    ) -> usize {
        if let Some(d) = memo.get(id) {
            return *d;
        }
        let d = deps
            .get(id)
            .into_iter()
            .flatten()
            .map(|dep| depth_of(dep, deps, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id.to_string(), d);
        d
    }

    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        let entry = deps.entry(node.id.as_str()).or_default();
        entry.extend(node.depends_on.iter().map(|s| s.as_str()));
    }
    // Branch gates participate in depth like declared edges
    for node in nodes {
        if let NodeKind::Branch { arms, else_nodes } = &node.kind {
            for target in arms.iter().flat_map(|a| &a.next_nodes).chain(else_nodes) {
                deps.entry(target.as_str()).or_default().push(&node.id);
            }
        }
    }

    let mut memo = HashMap::new();
    for node in nodes {
        depth_of(&node.id, &deps, &mut memo);
    }
    memo
}

/// Result of evaluating a branch node
#[derive(Debug, Clone, PartialEq)]
pub struct ArmSelection {
    /// Index of the selected arm; `None` means the else arm
    pub arm_index: Option<usize>,

    /// Targets released by the selection
    pub selected: Vec<String>,

    /// Targets of unselected arms, marked skipped
    pub skipped: Vec<String>,
}

/// Pick the first truthy arm (or else) of a branch
pub fn select_arm(
    arms: &[BranchArm],
    else_nodes: &[String],
    scope: &ScopeArena,
    frame: FrameId,
) -> Result<ArmSelection, TemplateError> {
    let mut arm_index = None;

    for (i, arm) in arms.iter().enumerate() {
        if evaluate_condition(&arm.when, scope, frame)? {
            arm_index = Some(i);
            break;
        }
    }

    let selected: Vec<String> = match arm_index {
        Some(i) => arms[i].next_nodes.clone(),
        None => else_nodes.to_vec(),
    };

    let mut skipped: Vec<String> = Vec::new();
    let all_targets = arms
        .iter()
        .flat_map(|a| &a.next_nodes)
        .chain(else_nodes.iter());
    for target in all_targets {
        if !selected.contains(target) && !skipped.contains(target) {
            skipped.push(target.clone());
        }
    }

    Ok(ArmSelection {
        arm_index,
        selected,
        skipped,
    })
}

/// Iteration key for one loop/parallel expansion
///
/// Keys are `/`-joined `<node_id>[<index>]` segments so nested expansions
/// stay unique: `fanout[2]`, `outer[0]/inner[3]`.
pub fn iteration_key(prefix: &str, node_id: &str, index: usize) -> String {
    if prefix.is_empty() {
        format!("{node_id}[{index}]")
    } else {
        format!("{prefix}/{node_id}[{index}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> Vec<Node> {
        vec![
            Node::task("a", "echo", json!({})),
            Node::task("b", "echo", json!({})).with_depends_on(["a"]),
            Node::task("c", "echo", json!({})).with_depends_on(["b"]),
        ]
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let nodes = chain();
        let mut tracker = NodeTracker::new(&nodes);

        assert_eq!(tracker.ready(&nodes), vec!["a"]);

        tracker.set("a", NodeStatus::Running);
        assert!(tracker.ready(&nodes).is_empty());

        tracker.set("a", NodeStatus::Completed);
        assert_eq!(tracker.ready(&nodes), vec!["b"]);
    }

    #[test]
    fn test_all_skipped_dependencies_skip_the_node() {
        let nodes = vec![
            Node::task("a", "echo", json!({})),
            Node::task("b", "echo", json!({})).with_depends_on(["a"]),
            Node::task("c", "echo", json!({})).with_depends_on(["b"]),
        ];
        let mut tracker = NodeTracker::new(&nodes);

        tracker.set("a", NodeStatus::Completed);
        tracker.set("b", NodeStatus::Skipped);

        assert_eq!(tracker.newly_skippable(&nodes), vec!["c"]);
        assert!(tracker.ready(&nodes).is_empty());
    }

    #[test]
    fn test_mixed_terminal_dependencies_stay_ready() {
        let nodes = vec![
            Node::task("a", "echo", json!({})),
            Node::task("b", "echo", json!({})),
            Node::task("c", "echo", json!({})).with_depends_on(["a", "b"]),
        ];
        let mut tracker = NodeTracker::new(&nodes);

        tracker.set("a", NodeStatus::Completed);
        tracker.set("b", NodeStatus::Skipped);

        // Not all dependencies skipped: c still runs
        assert_eq!(tracker.ready(&nodes), vec!["c"]);
        assert!(tracker.newly_skippable(&nodes).is_empty());
    }

    #[test]
    fn test_branch_targets_are_gated() {
        let nodes = vec![
            Node::branch(
                "route",
                vec![BranchArm {
                    when: "${inputs.flag}".to_string(),
                    next_nodes: vec!["left".to_string()],
                }],
                vec!["right".to_string()],
            ),
            Node::task("left", "echo", json!({})),
            Node::task("right", "echo", json!({})),
        ];
        let mut tracker = NodeTracker::new(&nodes);

        // Targets wait for the branch even with no declared depends_on
        assert_eq!(tracker.ready(&nodes), vec!["route"]);

        tracker.set("route", NodeStatus::Completed);
        tracker.set("right", NodeStatus::Skipped);
        assert_eq!(tracker.ready(&nodes), vec!["left"]);
    }

    #[test]
    fn test_restore_only_keeps_terminal_statuses() {
        let nodes = chain();
        let mut tracker = NodeTracker::new(&nodes);

        tracker.restore("a", NodeStatus::Completed);
        tracker.restore("b", NodeStatus::Running);

        assert_eq!(tracker.get("a"), NodeStatus::Completed);
        assert_eq!(tracker.get("b"), NodeStatus::Waiting);
        assert_eq!(tracker.ready(&nodes), vec!["b"]);
    }

    #[test]
    fn test_depth_map() {
        let nodes = vec![
            Node::task("a", "echo", json!({})),
            Node::task("b", "echo", json!({})).with_depends_on(["a"]),
            Node::task("c", "echo", json!({})).with_depends_on(["a", "b"]),
            Node::task("d", "echo", json!({})),
        ];
        let depths = depth_map(&nodes);

        assert_eq!(depths["a"], 0);
        assert_eq!(depths["b"], 1);
        assert_eq!(depths["c"], 2);
        assert_eq!(depths["d"], 0);
    }

    #[test]
    fn test_select_arm_first_truthy_wins() {
        let mut scope = ScopeArena::new(json!({}));
        let root = scope.root();
        scope.set_node_output(root, "detect", json!({"route": "left"}));

        let arms = vec![
            BranchArm {
                when: "${nodes.detect.output.route == \"right\"}".to_string(),
                next_nodes: vec!["r1".to_string()],
            },
            BranchArm {
                when: "${nodes.detect.output.route == \"left\"}".to_string(),
                next_nodes: vec!["l1".to_string(), "l2".to_string()],
            },
        ];
        let else_nodes = vec!["fallback".to_string()];

        let selection = select_arm(&arms, &else_nodes, &scope, root).unwrap();
        assert_eq!(selection.arm_index, Some(1));
        assert_eq!(selection.selected, vec!["l1", "l2"]);
        assert_eq!(selection.skipped, vec!["r1", "fallback"]);
    }

    #[test]
    fn test_select_arm_falls_through_to_else() {
        let scope = ScopeArena::new(json!({}));
        let root = scope.root();

        let arms = vec![BranchArm {
            when: "${inputs.missing}".to_string(),
            next_nodes: vec!["a".to_string()],
        }];
        let else_nodes = vec!["fallback".to_string()];

        let selection = select_arm(&arms, &else_nodes, &scope, root).unwrap();
        assert_eq!(selection.arm_index, None);
        assert_eq!(selection.selected, vec!["fallback"]);
        assert_eq!(selection.skipped, vec!["a"]);
    }

    #[test]
    fn test_iteration_keys() {
        assert_eq!(iteration_key("", "fanout", 2), "fanout[2]");
        assert_eq!(iteration_key("outer[0]", "inner", 3), "outer[0]/inner[3]");
    }
}
