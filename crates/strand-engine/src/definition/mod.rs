//! Workflow definition model
//!
//! A [`WorkflowDefinition`] is an immutable logical artifact identified by
//! `(name, version)`: a directed acyclic graph of [`Node`]s plus input and
//! output parameter schemas.

mod node;
mod validate;

pub use node::{
    BranchArm, ErrorMode, JoinType, Node, NodeKind, RetrySpec,
};
pub use validate::{resolve_inputs, validate_definition, ValidationError};

use serde::{Deserialize, Serialize};

/// Reference to a definition by name and version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: u32,
}

impl DefinitionRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Value types accepted by parameter schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    /// Check a JSON value against this type
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One declared workflow input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParameterType,

    #[serde(default)]
    pub required: bool,

    /// Default applied when the caller omits the parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl InputParameter {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// One declared workflow output
///
/// `source` is a template expression evaluated against the final scope
/// when the instance completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputParameter {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParameterType,

    pub source: String,
}

impl OutputParameter {
    pub fn new(
        name: impl Into<String>,
        param_type: ParameterType,
        source: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            source: source.into(),
        }
    }
}

/// Definition lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Archived,
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// An immutable workflow definition
///
/// Invariants (enforced by [`validate_definition`]):
/// - node ids are unique across the definition, including inline nodes
/// - every `depends_on` edge and branch target references an existing node
/// - the graph induced by `depends_on` is a DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Top-level nodes in definition order
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub inputs: Vec<InputParameter>,

    #[serde(default)]
    pub outputs: Vec<OutputParameter>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    pub status: DefinitionStatus,
}

impl WorkflowDefinition {
    /// Create an empty active definition
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            description: None,
            nodes: vec![],
            inputs: vec![],
            outputs: vec![],
            tags: vec![],
            category: None,
            status: DefinitionStatus::Active,
        }
    }

    /// Reference identifying this definition
    pub fn reference(&self) -> DefinitionRef {
        DefinitionRef::new(self.name.clone(), self.version)
    }

    /// Find a top-level node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_input(mut self, input: InputParameter) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: OutputParameter) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_status(mut self, status: DefinitionStatus) -> Self {
        self.status = status;
        self
    }
}
