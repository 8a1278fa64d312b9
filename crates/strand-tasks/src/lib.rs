//! Built-in task pack
//!
//! General-purpose executors any workflow can use, contributed to the
//! engine through a foreign registry scope. Bundles register through the
//! single entry point [`register_builtin`]; the engine resolves executor
//! names without caring which bundle provided them.

mod delay;
mod echo;
mod http;
mod transform;

pub use delay::DelayExecutor;
pub use echo::EchoExecutor;
pub use http::HttpRequestExecutor;
pub use transform::TransformExecutor;

use std::sync::Arc;

use strand_engine::{ExecutorScope, RegistryError};

/// Name of the scope this bundle contributes
pub const SCOPE_NAME: &str = "strand-tasks";

/// Build the bundle's registry scope with every built-in executor
pub fn builtin_scope() -> Result<ExecutorScope, RegistryError> {
    let mut scope = ExecutorScope::new(SCOPE_NAME);
    scope.register(Arc::new(EchoExecutor))?;
    scope.register(Arc::new(TransformExecutor))?;
    scope.register(Arc::new(DelayExecutor))?;
    scope.register(Arc::new(HttpRequestExecutor::new()))?;
    Ok(scope)
}

/// Register the built-in executors into a registry as a foreign scope
pub fn register_builtin(
    registry: &mut strand_engine::ExecutorRegistry,
) -> Result<(), RegistryError> {
    registry.add_scope(builtin_scope()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_engine::ExecutorRegistry;

    #[test]
    fn test_register_builtin_scope() {
        let mut registry = ExecutorRegistry::new();
        register_builtin(&mut registry).unwrap();

        for name in ["echo", "transform", "delay", "http_request"] {
            let executor = registry.resolve(name).unwrap();
            assert_eq!(executor.name(), name);
            assert_eq!(registry.origin(name).as_deref(), Some(SCOPE_NAME));
        }
    }
}
