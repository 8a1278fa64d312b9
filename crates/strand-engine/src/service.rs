//! Submission API
//!
//! The public surface callers use to submit and manage workflow instances.
//! Wire format is a concern of the gateway; this service exposes the
//! logical operations only.

use serde_json::Value;
use uuid::Uuid;

use crate::definition::{DefinitionRef, DefinitionStatus, WorkflowDefinition};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::EventRecord;
use crate::persistence::{
    CreateInstanceOptions, InstanceFilter, NodeInstance, Pagination, WorkflowInstance,
};

/// Options accepted by [`WorkflowService::create_instance`]
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub external_id: Option<String>,
    pub priority: i32,
    pub max_retries: u32,
    pub max_concurrency: usize,

    /// Start driving immediately instead of leaving the instance pending
    pub start: bool,
}

/// Instance view returned by [`WorkflowService::get`]
#[derive(Debug, Clone)]
pub struct InstanceView {
    pub instance: WorkflowInstance,

    /// Evaluated outputs (present once completed)
    pub outputs: Option<Value>,

    /// Node rollup: every node instance recorded so far
    pub nodes: Vec<NodeInstance>,
}

/// Submission service over one engine
#[derive(Clone)]
pub struct WorkflowService {
    engine: Engine,
}

impl WorkflowService {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Register (or replace) a definition
    pub async fn register_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        self.engine.register_definition(definition).await
    }

    /// Enumerate stored definitions
    pub async fn list_definitions(
        &self,
    ) -> Result<Vec<(DefinitionRef, DefinitionStatus)>, EngineError> {
        Ok(self.engine.store().list_definitions().await?)
    }

    /// Create an instance; optionally start driving it immediately
    pub async fn create_instance(
        &self,
        definition: &DefinitionRef,
        inputs: Value,
        opts: SubmitOptions,
    ) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .engine
            .create_instance(
                definition,
                inputs,
                CreateInstanceOptions {
                    external_id: opts.external_id,
                    priority: opts.priority,
                    max_retries: opts.max_retries,
                    max_concurrency: opts.max_concurrency,
                },
            )
            .await?;

        if opts.start {
            self.engine.spawn_instance(instance.id);
        }
        Ok(instance)
    }

    /// Start driving a pending instance
    pub async fn start(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let instance = self
            .engine
            .store()
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;

        self.engine.spawn_instance(id);
        Ok(instance)
    }

    /// Pause a running instance
    pub async fn pause(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance, EngineError> {
        self.engine.pause(id, reason).await
    }

    /// Resume a paused instance
    pub async fn resume(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.engine.resume(id).await
    }

    /// Cancel an instance; a no-op on already-cancelled instances
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<WorkflowInstance, EngineError> {
        self.engine.cancel(id, reason).await
    }

    /// Fetch an instance with its outputs and node rollup
    pub async fn get(&self, id: Uuid) -> Result<InstanceView, EngineError> {
        let store = self.engine.store();
        let instance = store
            .load_instance(id)
            .await?
            .ok_or(EngineError::InstanceNotFound(id))?;
        let nodes = store.load_node_instances(id).await?;

        Ok(InstanceView {
            outputs: instance.output_data.clone(),
            instance,
            nodes,
        })
    }

    /// List instances by filter, newest first
    pub async fn list(
        &self,
        filter: InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<WorkflowInstance>, EngineError> {
        Ok(self.engine.store().list_instances(filter, pagination).await?)
    }

    /// Audit events of one instance
    pub async fn events(&self, id: Uuid) -> Result<Vec<EventRecord>, EngineError> {
        Ok(self.engine.store().list_events(id).await?)
    }
}
