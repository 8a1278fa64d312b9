//! WorkflowStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{DefinitionRef, DefinitionStatus, WorkflowDefinition};
use crate::error::{FailureInfo, TaskError};
use crate::events::EventRecord;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// Requested status transition is illegal
    #[error("illegal transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// Ownership or uniqueness conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet dispatched
    Pending,

    /// An engine is driving the instance
    Running,

    /// Suspended; acquirable again via resume
    Paused,

    /// All nodes terminal, none failed
    Completed,

    /// A node failure exhausted its retries
    Failed,

    /// Externally cancelled
    Cancelled,
}

impl InstanceStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions of the instance state machine
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Node instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Dependencies not yet terminal
    Waiting,

    /// Eligible for dispatch
    Ready,

    /// An executor call is in flight
    Running,

    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition: DefinitionRef,
    pub status: InstanceStatus,

    /// Why the instance is in its current status (pause/cancel provenance)
    pub status_reason: Option<String>,

    pub input_data: serde_json::Value,

    /// Serialized scope arena
    pub context_data: serde_json::Value,

    /// Evaluated output parameters, set on completion
    pub output_data: Option<serde_json::Value>,

    /// User-visible failure shape, set on failure
    pub failure: Option<FailureInfo>,

    /// Most recently started node (informational)
    pub current_node_id: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Concurrency cap for this instance; 0 falls back to the engine default
    pub max_concurrency: usize,

    pub lease_owner: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub priority: i32,
    pub external_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of one node in one instance
///
/// At most one row exists per `(workflow_instance_id, node_id, iteration)`,
/// where `iteration` identifies the loop/parallel expansion path (empty for
/// top-level nodes). Retries update the row in place; `attempt` carries the
/// count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub node_id: String,
    pub iteration: String,
    pub status: NodeStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Resolved config captured at dispatch
    pub input_snapshot: Option<serde_json::Value>,

    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
}

impl NodeInstance {
    /// Create a fresh waiting row
    pub fn new(workflow_instance_id: Uuid, node_id: impl Into<String>, iteration: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_instance_id,
            node_id: node_id.into(),
            iteration: iteration.into(),
            status: NodeStatus::Waiting,
            attempt: 0,
            started_at: None,
            finished_at: None,
            input_snapshot: None,
            output: None,
            error: None,
        }
    }
}

/// A bounded-time ownership grant over one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub instance_id: Uuid,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Options accepted when creating an instance
#[derive(Debug, Clone, Default)]
pub struct CreateInstanceOptions {
    pub external_id: Option<String>,
    pub priority: i32,
    pub max_retries: u32,

    /// 0 falls back to the engine's configured default
    pub max_concurrency: usize,
}

/// Fields updated alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub context_data: Option<serde_json::Value>,
    pub output_data: Option<serde_json::Value>,
    pub failure: Option<FailureInfo>,
    pub current_node_id: Option<String>,
    pub reason: Option<String>,
}

impl InstancePatch {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Filter for listing instances
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub external_id: Option<String>,
    pub definition_name: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Aggregate counters emitted by the maintenance worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub running: u64,
    pub paused: u64,
    pub failed_last_24h: u64,
}

/// Store for definitions, instances, node states, leases, and events
///
/// The engine speaks to persistence through this narrow contract.
/// Implementations must be thread-safe, expose read-your-writes within a
/// single operation, and guarantee monotonic lease acquisition per
/// instance.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definition Operations
    // =========================================================================

    /// Insert or replace a definition by `(name, version)`
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    /// Load a definition
    async fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Enumerate stored definitions
    async fn list_definitions(&self) -> Result<Vec<(DefinitionRef, DefinitionStatus)>, StoreError>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Allocate an id and write a pending instance row
    ///
    /// `context` is the seeded root variable scope.
    async fn create_instance(
        &self,
        definition: &DefinitionRef,
        inputs: serde_json::Value,
        context: serde_json::Value,
        opts: CreateInstanceOptions,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Load an instance
    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Atomic compare-and-set status transition
    ///
    /// Fails with [`StoreError::InvalidTransition`] when the current status
    /// disallows the target.
    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        patch: InstancePatch,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Persist the variable scope (and current node pointer) under an
    /// ownership check
    async fn save_context(
        &self,
        id: Uuid,
        owner_id: &str,
        context: serde_json::Value,
        current_node_id: Option<String>,
    ) -> Result<(), StoreError>;

    /// Whether the given engine currently owns the instance
    async fn check_owner(&self, id: Uuid, owner_id: &str) -> Result<bool, StoreError>;

    /// List instances matching a filter, newest first
    async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Running instances whose heartbeat is older than the timeout
    async fn list_stale_instances(
        &self,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    // =========================================================================
    // Node Instance Operations
    // =========================================================================

    /// Insert or update by `(workflow_instance_id, node_id, iteration)`
    async fn upsert_node_instance(&self, node: &NodeInstance) -> Result<(), StoreError>;

    /// All node instances of one instance
    async fn load_node_instances(&self, instance_id: Uuid) -> Result<Vec<NodeInstance>, StoreError>;

    // =========================================================================
    // Lease Operations
    // =========================================================================

    /// Atomically acquire the lease
    ///
    /// Succeeds iff no lease exists or the existing lease is expired.
    /// Returns `None` when another engine holds a live lease.
    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError>;

    /// Renew the lease and bump the instance heartbeat
    ///
    /// Returns false when the caller no longer owns the lease.
    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Best-effort release
    async fn release_lease(&self, instance_id: Uuid, owner_id: &str) -> Result<(), StoreError>;

    /// Current lease row, live or expired
    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Append-only audit write
    async fn append_event(&self, event: EventRecord) -> Result<(), StoreError>;

    /// Events of one instance in append order
    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, StoreError>;

    /// Delete events older than the cutoff; returns rows removed
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Maintenance Operations
    // =========================================================================

    /// Drop node-instance rows of instances terminal since before the cutoff;
    /// returns instances compacted
    async fn compact_terminal_instances(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Aggregate counters for observability
    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}
