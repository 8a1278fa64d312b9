//! Execution context handed to task executors

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Progress payload reported by a running task
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub details: Option<serde_json::Value>,
}

/// Error from progress reporting
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// Progress channel closed (unit cancelled or timed out)
    #[error("progress channel closed")]
    ChannelClosed,

    /// Unit was cancelled
    #[error("unit was cancelled")]
    Cancelled,
}

/// Context provided to an executor for one attempt of one node
///
/// The context carries the resolved config and inputs snapshot, attempt
/// accounting, a cancellation flag, and a progress reporter.
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: ExecutionContext) -> Result<Value, TaskError> {
///     for i in 0..100 {
///         if ctx.is_cancelled() {
///             return Err(TaskError::non_retryable("cancelled"));
///         }
///         do_work(i).await?;
///         ctx.report_progress(Some(json!({"step": i}))).await.ok();
///     }
///     Ok(json!({"done": true}))
/// }
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    /// Instance that owns this unit
    pub instance_id: Uuid,

    /// Node id from the definition
    pub node_id: String,

    /// Loop/parallel expansion path; empty for top-level nodes
    pub iteration: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Config after template resolution
    pub config: serde_json::Value,

    /// Snapshot of the instance inputs
    pub inputs: serde_json::Value,

    /// Wall time when this attempt started
    pub started_at: DateTime<Utc>,

    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Create a new execution context
    pub fn new(
        instance_id: Uuid,
        node_id: impl Into<String>,
        iteration: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        config: serde_json::Value,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            instance_id,
            node_id: node_id.into(),
            iteration: iteration.into(),
            attempt,
            max_attempts,
            config,
            inputs,
            started_at: Utc::now(),
            progress_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a progress channel
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Get a handle that can be used to cancel this unit
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Report progress
    ///
    /// # Errors
    ///
    /// Returns an error if the unit has been cancelled or the progress
    /// channel is closed.
    pub async fn report_progress(
        &self,
        details: Option<serde_json::Value>,
    ) -> Result<(), ProgressError> {
        if self.is_cancelled() {
            return Err(ProgressError::Cancelled);
        }

        if let Some(tx) = &self.progress_tx {
            tx.send(ProgressUpdate { details })
                .await
                .map_err(|_| ProgressError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Get a future that resolves when cancellation is requested
    ///
    /// Useful for select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(TaskError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel a unit of work
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// Create a standalone handle, not tied to an executor context
    ///
    /// Used for units (sub-workflows, composite nodes) that have no
    /// [`ExecutionContext`] of their own.
    pub(crate) fn standalone() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolve when cancellation is requested
    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
