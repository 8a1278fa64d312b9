//! Executor registry with cross-scope lookup
//!
//! The registry maps the symbolic `executor` name on a task node to a
//! concrete [`TaskExecutor`]. Names are looked up across an ordered list of
//! *scopes*: foreign scopes contributed by sibling plugins at bootstrap,
//! probed in registration order, then the engine's local scope. The origin
//! scope of each resolution is cached for diagnostics.
//!
//! Registration happens at bootstrap and is locked thereafter; [`seal`]
//! makes later registration fail instead of racing the read path.
//!
//! [`seal`]: ExecutorRegistry::seal

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::definition::ValidationError;
use crate::error::TaskError;
use crate::task::ExecutionContext;

/// Name of the scope local to the engine instance
pub const LOCAL_SCOPE: &str = "local";

/// Executor health probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

/// A callable task implementation
///
/// # Example
///
/// ```ignore
/// struct SendEmail;
///
/// #[async_trait]
/// impl TaskExecutor for SendEmail {
///     fn name(&self) -> &str {
///         "send_email"
///     }
///
///     async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
///         // Send email...
///         Ok(json!({"message_id": "..."}))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Symbolic name task nodes use to reference this executor
    fn name(&self) -> &str;

    /// Optional implementation version, surfaced by [`ExecutorRegistry::list`]
    fn version(&self) -> Option<&str> {
        None
    }

    /// Execute one attempt of one unit of work
    ///
    /// Return a retryable [`TaskError`] for transient failures and a
    /// non-retryable one for permanent failures. Executors that observe
    /// `ctx.is_cancelled()` should stop promptly; they are not required to
    /// roll back side effects.
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, TaskError>;

    /// Liveness probe, used by operational tooling
    async fn health_check(&self) -> Health {
        Health::Healthy
    }

    /// Validate a node's raw (unresolved) config at definition time
    fn validate_config(&self, _config: &serde_json::Value) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Name already registered within the scope
    #[error("executor {name} already registered in scope {scope}")]
    DuplicateExecutor { scope: String, name: String },

    /// No scope provides the name
    #[error("unknown executor: {0}")]
    ExecutorNotFound(String),

    /// Registration attempted after bootstrap completed
    #[error("registry is sealed; executors register at bootstrap only")]
    Sealed,
}

/// One named collection of executors, contributed by a single plugin
pub struct ExecutorScope {
    name: String,
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorScope {
    /// Create an empty scope
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executors: HashMap::new(),
        }
    }

    /// Scope name (plugin identifier)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an executor under its own name
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) -> Result<(), RegistryError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) {
            return Err(RegistryError::DuplicateExecutor {
                scope: self.name.clone(),
                name,
            });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn TaskExecutor>> {
        self.executors.get(name)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ExecutorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorScope")
            .field("name", &self.name)
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Ordered multi-scope executor registry
///
/// Lookup probes foreign scopes in registration order, then the local
/// scope. The engine resolves a name without discriminating where it came
/// from, but the origin is cached and surfaced for diagnostics.
pub struct ExecutorRegistry {
    foreign: Vec<ExecutorScope>,
    local: ExecutorScope,
    origin_cache: DashMap<String, String>,
    sealed: AtomicBool,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            foreign: Vec::new(),
            local: ExecutorScope::new(LOCAL_SCOPE),
            origin_cache: DashMap::new(),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register an executor in the local scope
    pub fn register_local(
        &mut self,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.local.register(executor)
    }

    /// Contribute a plugin scope; later scopes probe after earlier ones
    pub fn add_scope(&mut self, scope: ExecutorScope) -> Result<(), RegistryError> {
        self.check_open()?;
        self.foreign.push(scope);
        Ok(())
    }

    /// Lock the registry; registration becomes an error
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    fn check_open(&self) -> Result<(), RegistryError> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(RegistryError::Sealed);
        }
        Ok(())
    }

    /// Resolve a name, walking foreign scopes then the local scope
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskExecutor>, RegistryError> {
        for scope in &self.foreign {
            if let Some(executor) = scope.get(name) {
                self.origin_cache
                    .insert(name.to_string(), scope.name().to_string());
                return Ok(executor.clone());
            }
        }

        if let Some(executor) = self.local.get(name) {
            self.origin_cache
                .insert(name.to_string(), LOCAL_SCOPE.to_string());
            return Ok(executor.clone());
        }

        Err(RegistryError::ExecutorNotFound(name.to_string()))
    }

    /// Scope that satisfied the most recent resolution of a name
    pub fn origin(&self, name: &str) -> Option<String> {
        self.origin_cache.get(name).map(|entry| entry.clone())
    }

    /// Enumerate all `(scope, name)` pairs in probe order
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for scope in &self.foreign {
            for name in scope.names() {
                out.push((scope.name().to_string(), name.to_string()));
            }
        }
        for name in self.local.names() {
            out.push((LOCAL_SCOPE.to_string(), name.to_string()));
        }
        out
    }

    /// Probe every registered executor's health
    pub async fn health(&self) -> Vec<(String, String, Health)> {
        let mut out = Vec::new();
        for scope in self.foreign.iter().chain(std::iter::once(&self.local)) {
            for (name, executor) in &scope.executors {
                out.push((
                    scope.name().to_string(),
                    name.clone(),
                    executor.health_check().await,
                ));
            }
        }
        out
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("scopes", &self.foreign)
            .field("local", &self.local)
            .finish()
    }
}
