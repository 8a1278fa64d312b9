//! Engine loop
//!
//! The engine binds the pieces: acquire the lease, load the instance and
//! its definition, run the dispatcher, renew the heartbeat, release the
//! lease. One engine process can drive many instances concurrently; the
//! lease guarantees at most one engine drives any one instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::{
    resolve_inputs, validate_definition, DefinitionRef, DefinitionStatus, ValidationError,
    WorkflowDefinition,
};
use crate::error::EngineError;
use crate::events::{EventKind, EventRecord};
use crate::lease::LeaseManager;
use crate::persistence::{
    CreateInstanceOptions, InstancePatch, InstanceStatus, StoreError, WorkflowInstance,
    WorkflowStore,
};
use crate::registry::ExecutorRegistry;
use crate::scheduler::{ChildDriver, Control, Dispatcher, RunOutcome, SuspendKind};
use crate::scope::ScopeArena;
use crate::template;

/// Handle to a locally running instance driver
struct RunnerHandle {
    control: watch::Sender<Control>,
}

struct EngineInner {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<ExecutorRegistry>,
    config: EngineConfig,
    lease: LeaseManager,
    global_slots: Arc<Semaphore>,
    running: DashMap<Uuid, RunnerHandle>,
}

/// The workflow engine
///
/// Cheap to clone; all clones share the same running-instance table and
/// global in-flight cap.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(store, registry, EngineConfig::default());
/// let instance = engine
///     .create_instance(&DefinitionRef::new("billing", 1), json!({"x": 1}), Default::default())
///     .await?;
/// let finished = engine.run_instance(instance.id).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        let lease = LeaseManager::new(
            store.clone(),
            config.engine_id.clone(),
            config.lease_ttl,
            config.heartbeat_interval,
        );
        let global_slots = Arc::new(Semaphore::new(config.global_inflight_cap));

        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                config,
                lease,
                global_slots,
                running: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a definition after validating its structural invariants
    ///
    /// Executors already present in the registry get a chance to reject a
    /// task node's raw config; names that resolve later are checked at
    /// dispatch time instead.
    pub async fn register_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        validate_definition(definition)?;

        for node in collect_tasks(&definition.nodes) {
            if let crate::definition::NodeKind::Task { executor, config } = &node.kind {
                if let Ok(resolved) = self.inner.registry.resolve(executor) {
                    resolved
                        .validate_config(config)
                        .map_err(EngineError::Validation)?;
                }
            }
        }

        self.inner.store.put_definition(definition).await?;
        info!(definition = %definition.reference(), "registered definition");
        Ok(())
    }

    /// Create an instance of an active definition
    ///
    /// Validates inputs against the definition's schema, applies defaults,
    /// and seeds the root variable scope.
    #[instrument(skip(self, inputs, opts), fields(definition = %definition))]
    pub async fn create_instance(
        &self,
        definition: &DefinitionRef,
        inputs: Value,
        opts: CreateInstanceOptions,
    ) -> Result<WorkflowInstance, EngineError> {
        let def = self
            .inner
            .store
            .get_definition(definition)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition.clone()))?;

        if def.status != DefinitionStatus::Active {
            return Err(EngineError::Validation(ValidationError::InactiveDefinition(
                definition.to_string(),
            )));
        }

        let effective = resolve_inputs(&def, &inputs)?;
        let scope = ScopeArena::new(effective.clone());

        let instance = self
            .inner
            .store
            .create_instance(definition, effective, scope.to_json(), opts)
            .await?;

        self.emit(EventRecord::instance(
            instance.id,
            EventKind::InstanceCreated,
            json!({"definition": definition.to_string(), "external_id": instance.external_id}),
        ))
        .await;

        info!(instance_id = %instance.id, "created instance");
        Ok(instance)
    }

    /// Drive one instance until terminal, paused, or ownership is lost
    ///
    /// Acquires the lease first; a held lease yields
    /// [`EngineError::LeaseUnavailable`] so the caller can skip the
    /// instance.
    #[instrument(skip(self), fields(engine_id = %self.inner.config.engine_id))]
    pub async fn run_instance(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let inner = &self.inner;

        let instance = inner
            .store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;
        if instance.status.is_terminal() {
            return Ok(instance);
        }

        if inner.lease.acquire(id).await?.is_none() {
            return Err(EngineError::LeaseUnavailable(id));
        }
        self.emit(EventRecord::instance(
            id,
            EventKind::LeaseAcquired,
            json!({"owner": inner.config.engine_id}),
        ))
        .await;

        let run = self.drive_owned(id).await;

        // Best-effort release unless ownership was already lost
        match &run {
            Ok((_, owner_ok)) if !owner_ok => {}
            _ => {
                if inner.lease.release(id).await.is_ok() {
                    self.emit(EventRecord::instance(
                        id,
                        EventKind::LeaseReleased,
                        json!({"owner": inner.config.engine_id}),
                    ))
                    .await;
                }
            }
        }

        inner.running.remove(&id);
        run.map(|(instance, _)| instance)
    }

    /// Drive an instance this engine already holds the lease for
    async fn drive_owned(&self, id: Uuid) -> Result<(WorkflowInstance, bool), EngineError> {
        let inner = &self.inner;

        // Reload under the lease and move to running
        let instance = inner
            .store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;

        let instance = match instance.status {
            InstanceStatus::Pending => {
                let updated = inner
                    .store
                    .update_instance_status(id, InstanceStatus::Running, InstancePatch::default())
                    .await?;
                self.emit(EventRecord::instance(id, EventKind::InstanceStarted, json!({})))
                    .await;
                updated
            }
            InstanceStatus::Paused => {
                let updated = inner
                    .store
                    .update_instance_status(id, InstanceStatus::Running, InstancePatch::default())
                    .await?;
                self.emit(EventRecord::instance(id, EventKind::InstanceResumed, json!({})))
                    .await;
                updated
            }
            InstanceStatus::Running => instance,
            terminal => {
                // Raced with an external transition while acquiring
                debug!(instance_id = %id, status = %terminal, "instance terminal before drive");
                return Ok((instance, true));
            }
        };

        let definition = inner
            .store
            .get_definition(&instance.definition)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(instance.definition.clone()))?;
        let definition = Arc::new(definition);

        let scope = ScopeArena::from_json(instance.context_data.clone())
            .unwrap_or_else(|_| ScopeArena::new(instance.input_data.clone()));
        let recovered = inner.store.load_node_instances(id).await?;

        let (control_tx, control_rx) = watch::channel(Control::Run);
        let owner_ok = Arc::new(AtomicBool::new(true));
        inner.running.insert(
            id,
            RunnerHandle {
                control: control_tx.clone(),
            },
        );

        let heartbeat = inner.lease.spawn_heartbeat(id);
        let monitor = spawn_monitor(
            inner.store.clone(),
            id,
            control_tx,
            heartbeat.lost(),
            owner_ok.clone(),
            inner.config.heartbeat_interval,
        );

        let dispatcher = Arc::new(Dispatcher::new(
            inner.store.clone(),
            inner.registry.clone(),
            Arc::new(self.clone()),
            inner.config.clone(),
            &instance,
            definition.clone(),
            scope,
            control_rx,
            owner_ok.clone(),
            inner.global_slots.clone(),
            recovered,
        ));

        let outcome = dispatcher.run().await;

        monitor.abort();
        heartbeat.stop();

        let outcome = outcome?;
        let context = dispatcher.scope_snapshot();

        match outcome {
            RunOutcome::Completed => {
                let outputs = evaluate_outputs(&definition, &context);
                self.finalize(
                    id,
                    InstanceStatus::Completed,
                    InstancePatch {
                        context_data: Some(context.to_json()),
                        output_data: Some(outputs),
                        ..Default::default()
                    },
                    EventKind::InstanceCompleted,
                )
                .await?;
            }
            RunOutcome::Failed(failure) => {
                info!(
                    instance_id = %id,
                    failed_node = ?failure.failed_node_id,
                    "instance failed"
                );
                self.finalize(
                    id,
                    InstanceStatus::Failed,
                    InstancePatch {
                        context_data: Some(context.to_json()),
                        failure: Some(failure),
                        ..Default::default()
                    },
                    EventKind::InstanceFailed,
                )
                .await?;
            }
            RunOutcome::Cancelled => {
                // The cancel request usually wrote the status already;
                // finalize covers engine-internal teardown paths
                self.finalize(
                    id,
                    InstanceStatus::Cancelled,
                    InstancePatch::default(),
                    EventKind::InstanceCancelled,
                )
                .await?;
            }
            RunOutcome::Suspended(SuspendKind::Paused) => {
                debug!(instance_id = %id, "dispatcher suspended on pause");
            }
            RunOutcome::Suspended(SuspendKind::OwnerLost) => {
                warn!(instance_id = %id, "dispatcher suspended after ownership loss");
                self.emit(EventRecord::instance(
                    id,
                    EventKind::LeaseLost,
                    json!({"owner": inner.config.engine_id}),
                ))
                .await;
            }
        }

        let final_instance = inner
            .store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;
        Ok((final_instance, owner_ok.load(Ordering::Acquire)))
    }

    /// Spawn `run_instance` in the background
    pub fn spawn_instance(&self, id: Uuid) -> JoinHandle<Result<WorkflowInstance, EngineError>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_instance(id).await })
    }

    /// Pause a running instance
    ///
    /// In-flight units finish and persist; nothing new dispatches.
    pub async fn pause(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance, EngineError> {
        let updated = self
            .inner
            .store
            .update_instance_status(id, InstanceStatus::Paused, InstancePatch::reason(reason))
            .await?;
        self.signal(id, Control::Pause);
        self.emit(EventRecord::instance(
            id,
            EventKind::InstancePaused,
            json!({"reason": reason}),
        ))
        .await;
        Ok(updated)
    }

    /// Resume a paused instance and start driving it
    pub async fn resume(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .inner
            .store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;

        if instance.status != InstanceStatus::Paused {
            return Err(EngineError::Store(StoreError::InvalidTransition {
                from: instance.status,
                to: InstanceStatus::Running,
            }));
        }

        let updated = self
            .inner
            .store
            .update_instance_status(id, InstanceStatus::Running, InstancePatch::default())
            .await?;
        self.emit(EventRecord::instance(id, EventKind::InstanceResumed, json!({})))
            .await;

        self.spawn_instance(id);
        Ok(updated)
    }

    /// Cancel an instance
    ///
    /// Cancelling an already-cancelled instance is a no-op returning
    /// success. Cancellation of in-flight units is cooperative, bounded by
    /// the grace window.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .inner
            .store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;

        if instance.status == InstanceStatus::Cancelled {
            return Ok(instance);
        }

        let updated = self
            .inner
            .store
            .update_instance_status(id, InstanceStatus::Cancelled, InstancePatch::reason(reason))
            .await?;
        self.signal(id, Control::Cancel);
        self.emit(EventRecord::instance(
            id,
            EventKind::InstanceCancelled,
            json!({"reason": reason}),
        ))
        .await;
        Ok(updated)
    }

    /// Nudge a locally running driver, if any
    fn signal(&self, id: Uuid, control: Control) {
        if let Some(handle) = self.inner.running.get(&id) {
            let _ = handle.control.send(control);
        }
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: InstanceStatus,
        patch: InstancePatch,
        kind: EventKind,
    ) -> Result<(), EngineError> {
        match self
            .inner
            .store
            .update_instance_status(id, status, patch)
            .await
        {
            Ok(_) => {
                self.emit(EventRecord::instance(id, kind, json!({}))).await;
                Ok(())
            }
            // An external transition (cancel, reclaim) won the race
            Err(StoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn emit(&self, event: EventRecord) {
        if let Err(e) = self.inner.store.append_event(event).await {
            warn!(error = %e, "failed to append event");
        }
    }
}

#[async_trait]
impl ChildDriver for Engine {
    async fn create_child(
        &self,
        definition: &DefinitionRef,
        inputs: Value,
    ) -> Result<Uuid, EngineError> {
        let instance = self
            .create_instance(definition, inputs, CreateInstanceOptions::default())
            .await?;
        Ok(instance.id)
    }

    async fn drive_child(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.run_instance(id).await
    }

    async fn cancel_child(&self, id: Uuid, reason: &str) -> Result<(), EngineError> {
        self.cancel(id, reason).await?;
        Ok(())
    }
}

/// Bridge ownership loss and external status changes into the control
/// channel
fn spawn_monitor(
    store: Arc<dyn WorkflowStore>,
    id: Uuid,
    control: watch::Sender<Control>,
    mut lost: watch::Receiver<bool>,
    owner_ok: Arc<AtomicBool>,
    heartbeat_interval: Duration,
) -> JoinHandle<()> {
    // External pause/cancel written by another process is observed by
    // polling; a local signal arrives through the control channel directly
    let poll = heartbeat_interval.min(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = lost.changed() => {
                    if changed.is_err() || *lost.borrow() {
                        owner_ok.store(false, Ordering::Release);
                        let _ = control.send(Control::OwnerLost);
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match store.load_instance(id).await {
                        Ok(Some(instance)) => match instance.status {
                            InstanceStatus::Paused => {
                                let _ = control.send(Control::Pause);
                            }
                            InstanceStatus::Cancelled => {
                                let _ = control.send(Control::Cancel);
                            }
                            _ => {}
                        },
                        Ok(None) => return,
                        Err(e) => {
                            debug!(instance_id = %id, error = %e, "monitor poll failed");
                        }
                    }
                }
            }
        }
    })
}

/// Task nodes of a definition, inline bodies included
fn collect_tasks(nodes: &[crate::definition::Node]) -> Vec<&crate::definition::Node> {
    use crate::definition::NodeKind;

    let mut out = Vec::new();
    for node in nodes {
        match &node.kind {
            NodeKind::Task { .. } => out.push(node),
            NodeKind::Parallel { nodes, .. } | NodeKind::Loop { nodes, .. } => {
                out.extend(collect_tasks(nodes));
            }
            NodeKind::ForEach { task_template, .. } => {
                out.extend(collect_tasks(std::slice::from_ref(task_template.as_ref())));
            }
            NodeKind::Branch { .. } | NodeKind::SubWorkflow { .. } => {}
        }
    }
    out
}

/// Evaluate the definition's output parameters against the final scope
fn evaluate_outputs(definition: &WorkflowDefinition, scope: &ScopeArena) -> Value {
    let mut outputs = Map::new();
    for param in &definition.outputs {
        let value = template::resolve(
            &Value::String(param.source.clone()),
            scope,
            scope.root(),
        )
        .unwrap_or_else(|e| {
            warn!(output = %param.name, error = %e, "output expression invalid");
            Value::Null
        });
        outputs.insert(param.name.clone(), value);
    }
    Value::Object(outputs)
}
