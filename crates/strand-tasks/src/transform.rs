//! Transform executor
//!
//! Re-shapes resolved config into an output value. The config's `value`
//! key becomes the output; an optional `wrap` key nests it under a name,
//! and `default` substitutes for a null value.

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_engine::{ExecutionContext, TaskError, TaskExecutor};

pub struct TransformExecutor;

#[async_trait]
impl TaskExecutor for TransformExecutor {
    fn name(&self) -> &str {
        "transform"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let mut value = ctx
            .config
            .get("value")
            .cloned()
            .unwrap_or(Value::Null);

        if value.is_null() {
            if let Some(default) = ctx.config.get("default") {
                value = default.clone();
            }
        }

        if let Some(wrap) = ctx.config.get("wrap").and_then(|w| w.as_str()) {
            return Ok(json!({ wrap: value }));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn ctx(config: Value) -> ExecutionContext {
        ExecutionContext::new(Uuid::now_v7(), "t", "", 1, 1, config, json!({}))
    }

    #[tokio::test]
    async fn test_value_passthrough() {
        let output = TransformExecutor
            .execute(ctx(json!({"value": [1, 2, 3]})))
            .await
            .unwrap();
        assert_eq!(output, json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_default_applies_to_null() {
        let output = TransformExecutor
            .execute(ctx(json!({"value": null, "default": "fallback"})))
            .await
            .unwrap();
        assert_eq!(output, json!("fallback"));
    }

    #[tokio::test]
    async fn test_wrap() {
        let output = TransformExecutor
            .execute(ctx(json!({"value": 7, "wrap": "count"})))
            .await
            .unwrap();
        assert_eq!(output, json!({"count": 7}));
    }
}
