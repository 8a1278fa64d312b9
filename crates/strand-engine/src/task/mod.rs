//! Task execution context

mod context;

pub use context::{CancellationHandle, ExecutionContext, ProgressError, ProgressUpdate};
