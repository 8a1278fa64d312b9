//! Echo executor
//!
//! Returns its resolved config verbatim. Useful for wiring values between
//! nodes and as a fixture in tests and examples.

use async_trait::async_trait;
use serde_json::Value;
use strand_engine::{ExecutionContext, TaskError, TaskExecutor};

pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        Ok(ctx.config)
    }
}
