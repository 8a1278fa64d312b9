//! Append-only audit events
//!
//! Events record state transitions, retries, and failovers for diagnostics.
//! They are never replayed to reconstruct state; the instance and node rows
//! are authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Instance lifecycle
    InstanceCreated,
    InstanceStarted,
    InstancePaused,
    InstanceResumed,
    InstanceCompleted,
    InstanceFailed,
    InstanceCancelled,

    // Node lifecycle
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    NodeCancelled,
    NodeRetryScheduled,
    NodeProgress,

    // Ownership
    LeaseAcquired,
    LeaseReleased,
    LeaseLost,
    OwnerTimeout,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "{}", s)
    }
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub node_id: Option<String>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl EventRecord {
    /// Create an instance-level event
    pub fn instance(instance_id: Uuid, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            node_id: None,
            kind,
            payload,
            ts: Utc::now(),
        }
    }

    /// Create a node-level event
    pub fn node(
        instance_id: Uuid,
        node_id: impl Into<String>,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            node_id: Some(node_id.into()),
            kind,
            payload,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::NodeRetryScheduled.to_string(), "node_retry_scheduled");
        assert_eq!(EventKind::OwnerTimeout.to_string(), "owner_timeout");
    }

    #[test]
    fn test_node_event() {
        let instance_id = Uuid::now_v7();
        let event = EventRecord::node(
            instance_id,
            "fetch",
            EventKind::NodeCompleted,
            serde_json::json!({"attempt": 1}),
        );

        assert_eq!(event.instance_id, instance_id);
        assert_eq!(event.node_id.as_deref(), Some("fetch"));
    }
}
