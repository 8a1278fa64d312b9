//! Hierarchical variable scopes
//!
//! A [`ScopeArena`] is the variable tree of one instance: one frame per
//! sub-workflow, loop iteration, and parallel branch, all stored in a flat
//! arena owned by the instance. Frames refer to their parent by index, so
//! there are no pointer cycles and the whole tree serializes into the
//! instance's `context_data` column.
//!
//! Lookups resolve the first path segment by walking from the active frame
//! toward the root; writes land in the frame named by the writer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Index of a frame within its arena
pub type FrameId = usize;

/// One path step when navigating a JSON value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// One variable frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub parent: Option<FrameId>,
    pub vars: Map<String, Value>,
}

/// Arena of variable frames rooted at the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeArena {
    frames: Vec<Frame>,
}

impl ScopeArena {
    /// Create an arena with the root frame seeded from the instance inputs
    pub fn new(inputs: Value) -> Self {
        let mut vars = Map::new();
        vars.insert("inputs".to_string(), inputs);
        vars.insert("nodes".to_string(), Value::Object(Map::new()));
        vars.insert("loops".to_string(), Value::Object(Map::new()));

        Self {
            frames: vec![Frame { parent: None, vars }],
        }
    }

    /// Rehydrate an arena from persisted context data
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Serialize the arena for persistence
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The instance root frame
    pub fn root(&self) -> FrameId {
        0
    }

    /// Open a child frame with the given bindings
    ///
    /// The child always carries its own `nodes` and `loops` namespaces so
    /// writes from inline nodes land in the child, not the parent.
    pub fn push_frame(&mut self, parent: FrameId, mut vars: Map<String, Value>) -> FrameId {
        vars.entry("nodes".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        vars.entry("loops".to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        self.frames.push(Frame {
            parent: Some(parent),
            vars,
        });
        self.frames.len() - 1
    }

    /// Resolve a path from the given frame, walking toward the root
    ///
    /// The nearest frame whose vars contain the first segment is probed
    /// first. If the rest of the path does not navigate within that frame's
    /// value, the walk continues toward the root, so a child's `nodes`
    /// namespace overlays rather than hides its ancestors'.
    pub fn lookup(&self, frame: FrameId, segments: &[PathSegment]) -> Option<&Value> {
        let first = match segments.first() {
            Some(PathSegment::Key(key)) => key,
            _ => return None,
        };

        let mut current = Some(frame);
        while let Some(id) = current {
            let f = self.frames.get(id)?;
            if let Some(value) = f.vars.get(first) {
                if let Some(found) = navigate(value, &segments[1..]) {
                    return Some(found);
                }
            }
            current = f.parent;
        }

        None
    }

    /// Record a node's output in the owning frame
    ///
    /// Outputs are written once, on the final successful attempt; earlier
    /// attempts never reach this method.
    pub fn set_node_output(&mut self, frame: FrameId, node_id: &str, output: Value) {
        let nodes = self.namespace_mut(frame, "nodes");
        nodes.insert(
            node_id.to_string(),
            serde_json::json!({ "output": output }),
        );
    }

    /// Read a node's output from the given frame (walking toward the root)
    pub fn node_output(&self, frame: FrameId, node_id: &str) -> Option<&Value> {
        self.lookup(
            frame,
            &[
                PathSegment::Key("nodes".to_string()),
                PathSegment::Key(node_id.to_string()),
                PathSegment::Key("output".to_string()),
            ],
        )
    }

    /// Record a loop's ordered results in the owning frame
    pub fn set_loop_results(&mut self, frame: FrameId, loop_id: &str, results: Vec<Value>) {
        let loops = self.namespace_mut(frame, "loops");
        loops.insert(
            loop_id.to_string(),
            serde_json::json!({ "results": results }),
        );
    }

    fn namespace_mut(&mut self, frame: FrameId, name: &str) -> &mut Map<String, Value> {
        let f = &mut self.frames[frame];
        f.vars
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("namespace is always an object")
    }

    /// Number of frames (root included)
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Navigate within one JSON value
fn navigate<'a>(mut value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    for segment in segments {
        value = match segment {
            PathSegment::Key(key) => value.get(key)?,
            PathSegment::Index(i) => value.get(i)?,
        };
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> PathSegment {
        PathSegment::Key(s.to_string())
    }

    #[test]
    fn test_root_lookup() {
        let scope = ScopeArena::new(json!({"x": 1}));
        let root = scope.root();

        let value = scope.lookup(root, &[key("inputs"), key("x")]);
        assert_eq!(value, Some(&json!(1)));
    }

    #[test]
    fn test_child_frame_shadows_and_falls_back() {
        let mut scope = ScopeArena::new(json!({"x": 1}));
        let root = scope.root();

        let mut vars = Map::new();
        vars.insert("item".to_string(), json!({"g": 2}));
        vars.insert("index".to_string(), json!(0));
        let child = scope.push_frame(root, vars);

        // Child binding resolves locally
        assert_eq!(
            scope.lookup(child, &[key("item"), key("g")]),
            Some(&json!(2))
        );
        // Missing locally, found at the root
        assert_eq!(
            scope.lookup(child, &[key("inputs"), key("x")]),
            Some(&json!(1))
        );
        // Root never sees child bindings
        assert_eq!(scope.lookup(root, &[key("item")]), None);
    }

    #[test]
    fn test_node_output_visibility() {
        let mut scope = ScopeArena::new(json!({}));
        let root = scope.root();
        let child = scope.push_frame(root, Map::new());

        scope.set_node_output(root, "detect", json!({"route": "left"}));
        scope.set_node_output(child, "inner", json!(7));

        // Child sees its own and the root's outputs
        assert_eq!(
            scope.node_output(child, "detect"),
            Some(&json!({"route": "left"}))
        );
        // The child's nodes namespace shadows the root's, so a child-frame
        // write is invisible from the root
        assert_eq!(scope.node_output(root, "inner"), None);
        assert_eq!(scope.node_output(child, "inner"), Some(&json!(7)));
    }

    #[test]
    fn test_loop_results() {
        let mut scope = ScopeArena::new(json!({}));
        let root = scope.root();
        scope.set_loop_results(root, "fanout", vec![json!(1), json!(2)]);

        assert_eq!(
            scope.lookup(
                root,
                &[
                    key("loops"),
                    key("fanout"),
                    key("results"),
                    PathSegment::Index(1)
                ]
            ),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_persistence_roundtrip() {
        let mut scope = ScopeArena::new(json!({"x": 1}));
        let root = scope.root();
        scope.set_node_output(root, "a", json!({"y": 2}));

        let json = scope.to_json();
        let restored = ScopeArena::from_json(json).unwrap();

        assert_eq!(
            restored.node_output(restored.root(), "a"),
            Some(&json!({"y": 2}))
        );
    }
}
