//! Delay executor
//!
//! Sleeps for `duration_ms`, honoring cooperative cancellation.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_engine::{ExecutionContext, TaskError, TaskExecutor};

pub struct DelayExecutor;

#[async_trait]
impl TaskExecutor for DelayExecutor {
    fn name(&self) -> &str {
        "delay"
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let millis = ctx
            .config
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| TaskError::non_retryable("delay requires a numeric duration_ms"))?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                Ok(json!({"slept_ms": millis}))
            }
            _ = ctx.cancelled() => {
                Err(TaskError::non_retryable("delay cancelled"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_delay_sleeps_and_reports() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            "wait",
            "",
            1,
            1,
            json!({"duration_ms": 5}),
            json!({}),
        );

        let output = DelayExecutor.execute(ctx).await.unwrap();
        assert_eq!(output, json!({"slept_ms": 5}));
    }

    #[tokio::test]
    async fn test_delay_rejects_missing_duration() {
        let ctx = ExecutionContext::new(Uuid::now_v7(), "wait", "", 1, 1, json!({}), json!({}));

        let result = DelayExecutor.execute(ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delay_observes_cancellation() {
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            "wait",
            "",
            1,
            1,
            json!({"duration_ms": 60_000}),
            json!({}),
        );
        let handle = ctx.cancellation_handle();

        let task = tokio::spawn(async move { DelayExecutor.execute(ctx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancellation should end the delay")
            .unwrap();
        assert!(result.is_err());
    }
}
