//! Error taxonomy shared across the engine
//!
//! Every failure the engine surfaces is classified by [`ErrorKind`]. Task
//! executors report [`TaskError`] values with an explicit `retryable` flag;
//! the scheduler converts them into node outcomes and, when attempts
//! exhaust, into the instance-level [`FailureInfo`] shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{DefinitionRef, ValidationError};
use crate::persistence::StoreError;
use crate::registry::RegistryError;
use crate::template::TemplateError;

/// Classification of engine failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Definition malformed or input fails schema; never retried
    Validation,

    /// Illegal state transition or lease lost
    Conflict,

    /// Unknown instance, definition, or executor name
    NotFound,

    /// Whatever the task raised; drives the retry ladder
    Executor,

    /// Task exceeded its timeout; retryable up to the ladder
    Timeout,

    /// Syntactically invalid template expression; fatal for the node
    Template,

    /// Infrastructural persistence fault
    Storage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not_found"),
            Self::Executor => write!(f, "executor"),
            Self::Timeout => write!(f, "timeout"),
            Self::Template => write!(f, "template"),
            Self::Storage => write!(f, "storage"),
        }
    }
}

/// Error type for task executor failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error message
    pub message: String,

    /// Classification of the failure
    pub kind: ErrorKind,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fail the node without further retry attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// Create a new retryable executor error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Executor,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable executor error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Executor,
            retryable: false,
            details: None,
        }
    }

    /// Create a timeout error (always retryable up to the retry ladder)
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Timeout,
            retryable: true,
            details: None,
        }
    }

    /// Create a template error (fatal for the node)
    pub fn template(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Template,
            retryable: false,
            details: None,
        }
    }

    /// Override the error kind
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

impl From<TemplateError> for TaskError {
    fn from(err: TemplateError) -> Self {
        Self::template(err.to_string())
    }
}

/// User-visible failure shape for a failed instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureInfo {
    /// Node whose terminal failure failed the instance
    pub failed_node_id: Option<String>,

    /// Attempt number that produced the terminal error
    pub failed_attempt: u32,

    /// Classification of the failure
    pub kind: ErrorKind,

    /// Error message
    pub message: String,

    /// Whether resubmission with the same inputs could succeed
    pub recoverable: bool,
}

impl FailureInfo {
    /// Build failure info from a node's terminal error
    pub fn from_task_error(node_id: &str, attempt: u32, error: &TaskError) -> Self {
        Self {
            failed_node_id: Some(node_id.to_string()),
            failed_attempt: attempt,
            kind: error.kind,
            message: error.message.clone(),
            recoverable: error.retryable,
        }
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Definition or input validation failed
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Template evaluation failed
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(DefinitionRef),

    /// Another engine holds the lease for this instance
    #[error("lease unavailable for instance {0}")]
    LeaseUnavailable(Uuid),

    /// Persistence could not be achieved within the bounded retry;
    /// the engine has yielded its lease
    #[error("persistent storage failure, lease yielded: {0}")]
    StorageExhausted(String),

    /// No dispatchable node remains but the instance is not terminal
    #[error("instance {0} stalled with no dispatchable nodes")]
    Stalled(Uuid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Classify this error for the public taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(StoreError::InvalidTransition { .. })
            | Self::Store(StoreError::Conflict(_))
            | Self::LeaseUnavailable(_) => ErrorKind::Conflict,
            Self::Store(StoreError::InstanceNotFound(_))
            | Self::Store(StoreError::DefinitionNotFound(_))
            | Self::InstanceNotFound(_)
            | Self::DefinitionNotFound(_) => ErrorKind::NotFound,
            Self::Store(_) | Self::StorageExhausted(_) => ErrorKind::Storage,
            Self::Registry(RegistryError::ExecutorNotFound(_)) => ErrorKind::NotFound,
            Self::Registry(_) => ErrorKind::Conflict,
            Self::Validation(_) | Self::Serialization(_) => ErrorKind::Validation,
            Self::Template(_) => ErrorKind::Template,
            Self::Stalled(_) => ErrorKind::Conflict,
        }
    }
}
