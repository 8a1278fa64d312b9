//! HTTP request executor
//!
//! Issues one HTTP request from resolved config. Network faults and 5xx
//! responses are retryable; 4xx responses are not.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use strand_engine::{ExecutionContext, TaskError, TaskExecutor};
use tracing::debug;

pub struct HttpRequestExecutor {
    client: reqwest::Client,
}

impl HttpRequestExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpRequestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpRequestExecutor {
    fn name(&self) -> &str {
        "http_request"
    }

    fn version(&self) -> Option<&str> {
        Some("1.0")
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
        let url = ctx
            .config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::non_retryable("http_request requires a url"))?;

        let method = ctx
            .config
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| TaskError::non_retryable(format!("unsupported method: {method}")))?;

        let mut request = self.client.request(method, url);
        if let Some(headers) = ctx.config.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = ctx.config.get("body") {
            request = request.json(body);
        }

        debug!(url, "issuing http request");

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| TaskError::retryable(e.to_string()))?,
            _ = ctx.cancelled() => {
                return Err(TaskError::non_retryable("http_request cancelled"));
            }
        };

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| TaskError::retryable(e.to_string()))?;
        let body: Value =
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        if status.is_client_error() {
            return Err(TaskError::non_retryable(format!("http {status}"))
                .with_details(json!({"status": status.as_u16(), "body": body})));
        }
        if status.is_server_error() {
            return Err(TaskError::retryable(format!("http {status}"))
                .with_details(json!({"status": status.as_u16(), "body": body})));
        }

        Ok(json!({"status": status.as_u16(), "body": body}))
    }
}
