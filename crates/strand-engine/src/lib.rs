//! # Strand Workflow Engine
//!
//! A durable workflow execution engine for declarative task graphs.
//!
//! ## Features
//!
//! - **Declarative definitions**: directed graphs of tasks, branches,
//!   parallels, loops, and sub-workflows, validated as DAGs
//! - **Template resolution**: `${path.to.var}` expressions evaluated
//!   against hierarchical variable scopes
//! - **Ownership leases**: per-instance heartbeats with takeover by a
//!   healthy engine when an owner dies
//! - **Automatic retries**: per-node retry ladders with exponential
//!   backoff and jitter; timeouts count as attempts
//! - **Cross-scope executors**: plugin bundles contribute executors by
//!   name through ordered registry scopes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowService                          │
//! │  (create / start / pause / resume / cancel / get / list)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (lease acquire → dispatch → heartbeat → release)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                             │
//! │  (ready queue, retry ladders, joins, cancellation)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL / in-memory: instances, nodes, leases, events) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use strand_engine::prelude::*;
//!
//! let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryStore::new());
//! let mut registry = ExecutorRegistry::new();
//! registry.register_local(Arc::new(MyExecutor))?;
//!
//! let engine = Engine::new(store, Arc::new(registry), EngineConfig::default());
//! engine.register_definition(&definition).await?;
//!
//! let instance = engine
//!     .create_instance(&definition.reference(), json!({"x": 1}), Default::default())
//!     .await?;
//! let finished = engine.run_instance(instance.id).await?;
//! assert_eq!(finished.status, InstanceStatus::Completed);
//! ```

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod lease;
pub mod maintenance;
pub mod persistence;
pub mod registry;
pub mod scheduler;
pub mod scope;
pub mod service;
pub mod task;
pub mod template;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::definition::{
        BranchArm, DefinitionRef, DefinitionStatus, ErrorMode, InputParameter, JoinType, Node,
        NodeKind, OutputParameter, ParameterType, RetrySpec, WorkflowDefinition,
    };
    pub use crate::engine::Engine;
    pub use crate::error::{EngineError, ErrorKind, FailureInfo, TaskError};
    pub use crate::persistence::{
        CreateInstanceOptions, InMemoryStore, InstanceFilter, InstanceStatus, NodeInstance,
        NodeStatus, Pagination, PostgresStore, StoreError, WorkflowInstance, WorkflowStore,
    };
    pub use crate::registry::{ExecutorRegistry, ExecutorScope, Health, TaskExecutor};
    pub use crate::service::{InstanceView, SubmitOptions, WorkflowService};
    pub use crate::task::ExecutionContext;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use definition::{
    BranchArm, DefinitionRef, DefinitionStatus, ErrorMode, InputParameter, JoinType, Node,
    NodeKind, OutputParameter, ParameterType, RetrySpec, ValidationError, WorkflowDefinition,
};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, FailureInfo, TaskError};
pub use events::{EventKind, EventRecord};
pub use lease::LeaseManager;
pub use maintenance::MaintenanceWorker;
pub use persistence::{
    CreateInstanceOptions, InMemoryStore, InstanceFilter, InstanceStatus, NodeInstance, NodeStatus,
    Pagination, PostgresStore, StoreError, WorkflowInstance, WorkflowStore,
};
pub use registry::{ExecutorRegistry, ExecutorScope, Health, RegistryError, TaskExecutor};
pub use service::{InstanceView, SubmitOptions, WorkflowService};
pub use task::{CancellationHandle, ExecutionContext};
pub use template::TemplateError;
