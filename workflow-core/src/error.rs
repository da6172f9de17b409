//! Error types for graph construction, execution, and persistence.
//!
//! `WorkflowError` is the single closed error enum used across the crate. It
//! mirrors the error-kind taxonomy of the engine (graph validation, step
//! failure, timeout, circuit-open, no-successor, invalid-resume, schema)
//! rather than leaking individual collaborators' error types.

use thiserror::Error;

/// Convenience alias for `Result<T, WorkflowError>`.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// All errors produced by graph construction, execution, and persistence.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Graph structure is invalid (duplicate step id, missing initial step,
    /// unknown `next_steps` target, dangling edge, ...). Rejected at
    /// build/register time, never at runtime.
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    /// A step's executor returned `Fail` or its underlying call errored, and
    /// no retry policy rescued it.
    #[error("step '{step_id}' failed: {message}")]
    StepFailure { step_id: String, message: String },

    /// A step exceeded its configured `timeout_ms`.
    #[error("step '{step_id}' timed out after {duration_ms}ms")]
    StepTimeout { step_id: String, duration_ms: u64 },

    /// The step's circuit breaker denied the invocation (state == Open).
    #[error("circuit open for step '{step_id}'")]
    CircuitOpen { step_id: String },

    /// A step produced a result whose payload matched no outgoing edge.
    #[error("no successor edge for step '{step_id}' with produced payload type '{payload_type}'")]
    NoSuccessor { step_id: String, payload_type: String },

    /// `resume` was called on an instance that was not `SUSPENDED`, or the
    /// resume input could not be converted to the suspension's declared
    /// `next_input_type`.
    #[error("invalid resume for instance '{instance_id}': {reason}")]
    InvalidResume { instance_id: String, reason: String },

    /// An `Async` result named a `task_id` matching no registered handler
    /// pattern.
    #[error("no async handler registered for task id '{0}'")]
    AsyncHandlerMissing(String),

    /// An async handler's `timeout_ms` elapsed before it produced a result.
    #[error("async handler timed out for task id '{task_id}' after {duration_ms}ms")]
    AsyncTimeout { task_id: String, duration_ms: u64 },

    /// The Type/Schema service has no schema registered under this name.
    #[error("schema unknown: {0}")]
    SchemaUnknown(String),

    /// Converting a value to/from a properties map failed for one property.
    #[error("conversion failed for type '{type_name}', property '{key}': {reason}")]
    ConversionFailed {
        type_name: String,
        key: String,
        reason: String,
    },

    /// A workflow instance or graph could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two different graph structures were registered under the same
    /// `(id, version)`.
    #[error("workflow '{id}' version '{version}' is already registered with a different graph")]
    DuplicateRegistration { id: String, version: String },

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization error, used by the graph visualization/export
    /// surface.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Application-defined error surfaced from a step or handler.
    #[error("{0}")]
    Custom(String),
}

impl WorkflowError {
    pub fn step_failure(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepFailure {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    pub fn no_successor(step_id: impl Into<String>, payload_type: impl Into<String>) -> Self {
        Self::NoSuccessor {
            step_id: step_id.into(),
            payload_type: payload_type.into(),
        }
    }

    pub fn invalid_resume(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResume {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }

    pub fn conversion_failed(
        type_name: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConversionFailed {
            type_name: type_name.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True for error kinds that represent a normal, retryable step failure
    /// as opposed to a structural/authoring error.
    pub fn is_retryable_kind(&self) -> bool {
        matches!(
            self,
            Self::StepFailure { .. } | Self::StepTimeout { .. } | Self::CircuitOpen { .. }
        )
    }
}
