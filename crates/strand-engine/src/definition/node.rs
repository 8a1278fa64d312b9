//! Node model
//!
//! A node is a tagged record: common scheduling fields plus a kind-specific
//! payload. Inline nodes (inside parallel and loop bodies) reuse the same
//! type.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::option_duration_millis;
use crate::definition::DefinitionRef;

/// Retry ladder configured per node
///
/// Delay before re-entering `ready` after a failed attempt:
/// `base_delay * backoff_multiplier^(attempt-1) * (1 ± jitter)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySpec {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "crate::config::duration_millis")]
    pub base_delay: Duration,

    /// Backoff multiplier (e.g. 2.0 for exponential)
    pub backoff_multiplier: f64,

    /// Jitter fraction (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetrySpec {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt may follow the given (1-based) attempt
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the retry that follows the given failed attempt
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let factor = 1.0 + rng.gen_range(-self.jitter..self.jitter);
            (base * factor).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Join rule for parallel and dynamic-loop frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Complete when every child is terminal
    #[default]
    All,

    /// Complete on the first successful child; cancel the rest
    Any,

    /// Complete on the first terminal child, success or failure; cancel the rest
    Race,
}

/// Failure handling for parallel and dynamic-loop frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    /// First child failure cancels peers and fails the frame
    #[default]
    FailFast,

    /// Peers keep running; the frame completes with a mixed result set
    Continue,
}

/// One arm of a branch node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    /// Boolean condition evaluated against the scope
    pub when: String,

    /// Node ids released when this arm is selected
    pub next_nodes: Vec<String>,
}

/// Kind-specific node payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Dispatch one unit of work to a named executor
    Task {
        executor: String,

        /// Object literal with embedded template expressions
        #[serde(default)]
        config: serde_json::Value,
    },

    /// Select exactly one arm; unselected arms' targets are skipped
    Branch {
        arms: Vec<BranchArm>,

        #[serde(rename = "else", default)]
        else_nodes: Vec<String>,
    },

    /// Run inline children concurrently under a local cap
    Parallel {
        nodes: Vec<Node>,

        /// 0 means no local cap (still bounded by instance and global caps)
        #[serde(default)]
        max_concurrency: usize,

        #[serde(default)]
        join_type: JoinType,

        #[serde(default)]
        error_handling: ErrorMode,
    },

    /// Fixed-count loop over inline children
    Loop {
        iterations: u32,

        nodes: Vec<Node>,

        /// 1 (the default) runs iterations sequentially
        #[serde(default = "default_loop_concurrency")]
        max_concurrency: usize,
    },

    /// Data-driven loop: one task per element of a source array
    ForEach {
        /// Template/JSONPath expression producing an array
        source_expression: String,

        /// Template instantiated once per element with `{item, index}` bound
        task_template: Box<Node>,

        #[serde(default)]
        max_concurrency: usize,

        #[serde(default)]
        join_type: JoinType,

        #[serde(default)]
        error_handling: ErrorMode,
    },

    /// Run a referenced definition as a child instance
    SubWorkflow {
        definition: DefinitionRef,

        /// Object of template expressions producing the child's inputs
        #[serde(default)]
        input_mapping: serde_json::Value,
    },
}

fn default_loop_concurrency() -> usize {
    1
}

/// A graph vertex in a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Node ids that must be terminal before this node becomes ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,

    /// Per-attempt execution timeout
    #[serde(
        default,
        with = "option_duration_millis",
        rename = "timeout_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Create a task node
    pub fn task(id: impl Into<String>, executor: impl Into<String>, config: serde_json::Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::Task {
                executor: executor.into(),
                config,
            },
        }
    }

    /// Create a branch node
    pub fn branch(id: impl Into<String>, arms: Vec<BranchArm>, else_nodes: Vec<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::Branch { arms, else_nodes },
        }
    }

    /// Create a parallel node
    pub fn parallel(id: impl Into<String>, nodes: Vec<Node>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::Parallel {
                nodes,
                max_concurrency: 0,
                join_type: JoinType::All,
                error_handling: ErrorMode::FailFast,
            },
        }
    }

    /// Create a static loop node
    pub fn repeat(id: impl Into<String>, iterations: u32, nodes: Vec<Node>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::Loop {
                iterations,
                nodes,
                max_concurrency: 1,
            },
        }
    }

    /// Create a dynamic loop node
    pub fn for_each(
        id: impl Into<String>,
        source_expression: impl Into<String>,
        task_template: Node,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::ForEach {
                source_expression: source_expression.into(),
                task_template: Box::new(task_template),
                max_concurrency: 0,
                join_type: JoinType::All,
                error_handling: ErrorMode::FailFast,
            },
        }
    }

    /// Create a sub-workflow node
    pub fn sub_workflow(
        id: impl Into<String>,
        definition: DefinitionRef,
        input_mapping: serde_json::Value,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            depends_on: vec![],
            retry: None,
            timeout: None,
            kind: NodeKind::SubWorkflow {
                definition,
                input_mapping,
            },
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mutate kind-specific knobs shared by parallel and for-each nodes
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        match &mut self.kind {
            NodeKind::Parallel {
                max_concurrency, ..
            }
            | NodeKind::ForEach {
                max_concurrency, ..
            }
            | NodeKind::Loop {
                max_concurrency, ..
            } => *max_concurrency = max,
            _ => {}
        }
        self
    }

    pub fn with_join_type(mut self, join: JoinType) -> Self {
        match &mut self.kind {
            NodeKind::Parallel { join_type, .. } | NodeKind::ForEach { join_type, .. } => {
                *join_type = join
            }
            _ => {}
        }
        self
    }

    pub fn with_error_handling(mut self, mode: ErrorMode) -> Self {
        match &mut self.kind {
            NodeKind::Parallel { error_handling, .. }
            | NodeKind::ForEach { error_handling, .. } => *error_handling = mode,
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_delay_ladder() {
        let retry = RetrySpec::new(4)
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(0.0);

        assert_eq!(retry.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_after_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_jitter_bounds() {
        let retry = RetrySpec::new(3)
            .with_base_delay(Duration::from_millis(1000))
            .with_backoff_multiplier(1.0)
            .with_jitter(0.5);

        for _ in 0..32 {
            let delay = retry.delay_after_attempt(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_attempts_remaining() {
        let retry = RetrySpec::new(3);
        assert!(retry.has_attempts_remaining(1));
        assert!(retry.has_attempts_remaining(2));
        assert!(!retry.has_attempts_remaining(3));
    }

    #[test]
    fn test_task_node_serialization() {
        let node = Node::task("fetch", "http_request", json!({"url": "${inputs.url}"}))
            .with_depends_on(["prep"])
            .with_timeout(Duration::from_secs(5));

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["executor"], "http_request");
        assert_eq!(value["timeout_ms"], 5000);

        let parsed: Node = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.depends_on, vec!["prep"]);
        assert_eq!(parsed.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_branch_serialization_uses_else_key() {
        let node = Node::branch(
            "route",
            vec![BranchArm {
                when: "${nodes.detect.output.route == \"left\"}".to_string(),
                next_nodes: vec!["left".to_string()],
            }],
            vec!["right".to_string()],
        );

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["else"], json!(["right"]));
    }

    #[test]
    fn test_error_mode_kebab_case() {
        let json = serde_json::to_value(ErrorMode::FailFast).unwrap();
        assert_eq!(json, "fail-fast");
    }

    #[test]
    fn test_for_each_roundtrip() {
        let node = Node::for_each(
            "fanout",
            "${nodes.prep.output.groups}",
            Node::task("work", "echo", json!({"g": "${item.g}"})),
        )
        .with_max_concurrency(2)
        .with_error_handling(ErrorMode::Continue);

        let json = serde_json::to_string(&node).unwrap();
        let parsed: Node = serde_json::from_str(&json).unwrap();

        match parsed.kind {
            NodeKind::ForEach {
                max_concurrency,
                error_handling,
                ..
            } => {
                assert_eq!(max_concurrency, 2);
                assert_eq!(error_handling, ErrorMode::Continue);
            }
            _ => panic!("expected for_each"),
        }
    }
}
