//! In-memory implementation of WorkflowStore for testing and embedded use

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::definition::{DefinitionRef, DefinitionStatus, WorkflowDefinition};
use crate::events::EventRecord;

/// In-memory implementation of [`WorkflowStore`]
///
/// Primarily for tests. Provides the same semantics as the PostgreSQL
/// implementation, including lease atomicity and status CAS.
///
/// # Example
///
/// ```
/// use strand_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
pub struct InMemoryStore {
    definitions: RwLock<HashMap<(String, u32), WorkflowDefinition>>,
    instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    node_instances: RwLock<HashMap<Uuid, Vec<NodeInstance>>>,
    leases: RwLock<HashMap<Uuid, Lease>>,
    events: RwLock<Vec<EventRecord>>,
}

impl InMemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            node_instances: RwLock::new(HashMap::new()),
            leases: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
        }
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.definitions.write().clear();
        self.instances.write().clear();
        self.node_instances.write().clear();
        self.leases.write().clear();
        self.events.write().clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn put_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.definitions.write().insert(
            (definition.name.clone(), definition.version),
            definition.clone(),
        );
        Ok(())
    }

    async fn get_definition(
        &self,
        reference: &DefinitionRef,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .get(&(reference.name.clone(), reference.version))
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<(DefinitionRef, DefinitionStatus)>, StoreError> {
        let mut out: Vec<_> = self
            .definitions
            .read()
            .values()
            .map(|d| (d.reference(), d.status))
            .collect();
        out.sort_by(|a, b| (&a.0.name, a.0.version).cmp(&(&b.0.name, b.0.version)));
        Ok(out)
    }

    async fn create_instance(
        &self,
        definition: &DefinitionRef,
        inputs: serde_json::Value,
        context: serde_json::Value,
        opts: CreateInstanceOptions,
    ) -> Result<WorkflowInstance, StoreError> {
        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition: definition.clone(),
            status: InstanceStatus::Pending,
            status_reason: None,
            input_data: inputs,
            context_data: context,
            output_data: None,
            failure: None,
            current_node_id: None,
            retry_count: 0,
            max_retries: opts.max_retries,
            max_concurrency: opts.max_concurrency,
            lease_owner: None,
            last_heartbeat_at: None,
            priority: opts.priority,
            external_id: opts.external_id,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };

        self.instances.write().insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.instances.read().get(&id).cloned())
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        status: InstanceStatus,
        patch: InstancePatch,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        if !instance.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: instance.status,
                to: status,
            });
        }

        let now = Utc::now();
        instance.status = status;
        instance.status_reason = patch.reason;
        instance.updated_at = now;

        if status == InstanceStatus::Running && instance.started_at.is_none() {
            instance.started_at = Some(now);
        }
        if status.is_terminal() {
            instance.finished_at = Some(now);
        }

        if let Some(context) = patch.context_data {
            instance.context_data = context;
        }
        if let Some(output) = patch.output_data {
            instance.output_data = Some(output);
        }
        if let Some(failure) = patch.failure {
            instance.failure = Some(failure);
        }
        if let Some(node_id) = patch.current_node_id {
            instance.current_node_id = Some(node_id);
        }

        Ok(instance.clone())
    }

    async fn save_context(
        &self,
        id: Uuid,
        owner_id: &str,
        context: serde_json::Value,
        current_node_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        if instance.lease_owner.as_deref() != Some(owner_id) {
            return Err(StoreError::Conflict(format!(
                "instance {id} is not owned by {owner_id}"
            )));
        }

        instance.context_data = context;
        if let Some(node_id) = current_node_id {
            instance.current_node_id = Some(node_id);
        }
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn check_owner(&self, id: Uuid, owner_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .instances
            .read()
            .get(&id)
            .map(|i| i.lease_owner.as_deref() == Some(owner_id))
            .unwrap_or(false))
    }

    async fn list_instances(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let instances = self.instances.read();
        let mut matching: Vec<_> = instances
            .values()
            .filter(|i| filter.status.map(|s| i.status == s).unwrap_or(true))
            .filter(|i| {
                filter
                    .external_id
                    .as_deref()
                    .map(|e| i.external_id.as_deref() == Some(e))
                    .unwrap_or(true)
            })
            .filter(|i| {
                filter
                    .definition_name
                    .as_deref()
                    .map(|n| i.definition.name == n)
                    .unwrap_or(true)
            })
            .filter(|i| filter.created_after.map(|t| i.created_at >= t).unwrap_or(true))
            .filter(|i| filter.created_before.map(|t| i.created_at < t).unwrap_or(true))
            .cloned()
            .collect();

        // Newest first; uuid v7 ids are time-ordered
        matching.sort_by(|a, b| b.id.cmp(&a.id));

        Ok(matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn list_stale_instances(
        &self,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(heartbeat_timeout)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut stale: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.status == InstanceStatus::Running)
            .filter(|i| i.last_heartbeat_at.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect();

        stale.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(stale)
    }

    async fn upsert_node_instance(&self, node: &NodeInstance) -> Result<(), StoreError> {
        let mut all = self.node_instances.write();
        let rows = all.entry(node.workflow_instance_id).or_default();

        match rows
            .iter_mut()
            .find(|r| r.node_id == node.node_id && r.iteration == node.iteration)
        {
            Some(existing) => *existing = node.clone(),
            None => rows.push(node.clone()),
        }

        Ok(())
    }

    async fn load_node_instances(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<NodeInstance>, StoreError> {
        Ok(self
            .node_instances
            .read()
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn acquire_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Database(e.to_string()))?;

        let mut leases = self.leases.write();

        if let Some(existing) = leases.get(&instance_id) {
            if !existing.is_expired(now) && existing.owner_id != owner_id {
                return Ok(None);
            }
        }

        let lease = Lease {
            instance_id,
            owner_id: owner_id.to_string(),
            acquired_at: now,
            last_heartbeat_at: now,
            expires_at: now + ttl,
        };
        leases.insert(instance_id, lease.clone());

        if let Some(instance) = self.instances.write().get_mut(&instance_id) {
            instance.lease_owner = Some(owner_id.to_string());
            instance.last_heartbeat_at = Some(now);
            instance.updated_at = now;
        }

        Ok(Some(lease))
    }

    async fn renew_lease(
        &self,
        instance_id: Uuid,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Database(e.to_string()))?;

        let mut leases = self.leases.write();
        match leases.get_mut(&instance_id) {
            Some(lease) if lease.owner_id == owner_id => {
                lease.last_heartbeat_at = now;
                lease.expires_at = now + ttl;

                if let Some(instance) = self.instances.write().get_mut(&instance_id) {
                    instance.last_heartbeat_at = Some(now);
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, instance_id: Uuid, owner_id: &str) -> Result<(), StoreError> {
        let mut leases = self.leases.write();
        if leases
            .get(&instance_id)
            .map(|l| l.owner_id == owner_id)
            .unwrap_or(false)
        {
            leases.remove(&instance_id);
            if let Some(instance) = self.instances.write().get_mut(&instance_id) {
                instance.lease_owner = None;
            }
        }
        Ok(())
    }

    async fn get_lease(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError> {
        Ok(self.leases.read().get(&instance_id).cloned())
    }

    async fn append_event(&self, event: EventRecord) -> Result<(), StoreError> {
        self.events.write().push(event);
        Ok(())
    }

    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn purge_events_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut events = self.events.write();
        let before = events.len();
        events.retain(|e| e.ts >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn compact_terminal_instances(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let instances = self.instances.read();
        let compactable: Vec<Uuid> = instances
            .values()
            .filter(|i| i.status.is_terminal())
            .filter(|i| i.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|i| i.id)
            .collect();
        drop(instances);

        let mut rows = self.node_instances.write();
        let mut compacted = 0;
        for id in compactable {
            if rows.remove(&id).is_some() {
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let instances = self.instances.read();
        let day_ago = Utc::now() - chrono::Duration::hours(24);

        Ok(StatusCounts {
            running: instances
                .values()
                .filter(|i| i.status == InstanceStatus::Running)
                .count() as u64,
            paused: instances
                .values()
                .filter(|i| i.status == InstanceStatus::Paused)
                .count() as u64,
            failed_last_24h: instances
                .values()
                .filter(|i| i.status == InstanceStatus::Failed)
                .filter(|i| i.finished_at.map(|t| t >= day_ago).unwrap_or(false))
                .count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    async fn create(store: &InMemoryStore) -> WorkflowInstance {
        store
            .create_instance(
                &DefinitionRef::new("wf", 1),
                json!({"x": 1}),
                json!({"frames": []}),
                CreateInstanceOptions::default(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = store();
        let instance = create(&store).await;

        let loaded = store.load_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Pending);
        assert_eq!(loaded.input_data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_status_cas() {
        let store = store();
        let instance = create(&store).await;

        store
            .update_instance_status(instance.id, InstanceStatus::Running, InstancePatch::default())
            .await
            .unwrap();

        // pending -> completed is illegal after running
        let err = store
            .update_instance_status(instance.id, InstanceStatus::Pending, InstancePatch::default())
            .await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));

        store
            .update_instance_status(
                instance.id,
                InstanceStatus::Completed,
                InstancePatch::default(),
            )
            .await
            .unwrap();

        // Terminal states are absorbing
        let err = store
            .update_instance_status(instance.id, InstanceStatus::Running, InstancePatch::default())
            .await;
        assert!(matches!(err, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let store = store();
        let instance = create(&store).await;
        let ttl = Duration::from_secs(60);

        let lease = store
            .acquire_lease(instance.id, "engine-a", ttl)
            .await
            .unwrap();
        assert!(lease.is_some());

        // Second engine cannot acquire a live lease
        let denied = store
            .acquire_lease(instance.id, "engine-b", ttl)
            .await
            .unwrap();
        assert!(denied.is_none());

        // Renewal only succeeds for the owner
        assert!(store.renew_lease(instance.id, "engine-a", ttl).await.unwrap());
        assert!(!store.renew_lease(instance.id, "engine-b", ttl).await.unwrap());

        store.release_lease(instance.id, "engine-a").await.unwrap();
        let lease = store
            .acquire_lease(instance.id, "engine-b", ttl)
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = store();
        let instance = create(&store).await;

        store
            .acquire_lease(instance.id, "engine-a", Duration::from_millis(0))
            .await
            .unwrap();

        let lease = store
            .acquire_lease(instance.id, "engine-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_some());
        assert_eq!(lease.unwrap().owner_id, "engine-b");
    }

    #[tokio::test]
    async fn test_node_instance_upsert_is_keyed_by_iteration() {
        let store = store();
        let instance = create(&store).await;

        let mut row = NodeInstance::new(instance.id, "work", "fanout[0]");
        store.upsert_node_instance(&row).await.unwrap();

        row.status = NodeStatus::Completed;
        store.upsert_node_instance(&row).await.unwrap();

        let other = NodeInstance::new(instance.id, "work", "fanout[1]");
        store.upsert_node_instance(&other).await.unwrap();

        let rows = store.load_node_instances(instance.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows.iter()
                .find(|r| r.iteration == "fanout[0]")
                .unwrap()
                .status,
            NodeStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_save_context_requires_ownership() {
        let store = store();
        let instance = create(&store).await;

        let err = store
            .save_context(instance.id, "engine-a", json!({}), None)
            .await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        store
            .acquire_lease(instance.id, "engine-a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .save_context(instance.id, "engine-a", json!({"frames": []}), Some("a".into()))
            .await
            .unwrap();

        let loaded = store.load_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_node_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_stale_instance_scan() {
        let store = store();
        let instance = create(&store).await;

        store
            .acquire_lease(instance.id, "engine-a", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .update_instance_status(instance.id, InstanceStatus::Running, InstancePatch::default())
            .await
            .unwrap();

        // Fresh heartbeat: not stale
        let stale = store
            .list_stale_instances(Duration::from_secs(30))
            .await
            .unwrap();
        assert!(stale.is_empty());

        // Zero timeout: everything with a heartbeat in the past is stale
        tokio::time::sleep(Duration::from_millis(5)).await;
        let stale = store
            .list_stale_instances(Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn test_event_purge() {
        let store = store();
        let instance = create(&store).await;

        store
            .append_event(EventRecord::instance(
                instance.id,
                EventKind::InstanceCreated,
                json!({}),
            ))
            .await
            .unwrap();

        let removed = store
            .purge_events_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_list_filter_and_pagination() {
        let store = store();
        for _ in 0..3 {
            create(&store).await;
        }

        let page = store
            .list_instances(
                InstanceFilter {
                    status: Some(InstanceStatus::Pending),
                    ..Default::default()
                },
                Pagination {
                    offset: 1,
                    limit: 1,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.len(), 1);
    }
}
