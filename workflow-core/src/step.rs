//! [`StepResult`] — the closed return-type variant of every step — and the
//! [`StepExecutor`] function type invoked by the workflow engine.
//!
//! Expressed as a Rust `enum`, per the Design Note in spec.md §9: "use
//! tagged unions or language-native sum types; do not leak these as an
//! inheritance hierarchy beyond what the contract requires."

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::WorkflowError;

/// The closed result variant every step function returns (§3 StepResult).
#[derive(Debug, Clone)]
pub enum StepResult {
    /// Value flows to the next Sequential/Branch-compatible step.
    Continue(Value),
    /// Value selects a branch edge by its runtime payload type tag.
    Branch { payload_type: String, value: Value },
    /// Workflow yields to its caller awaiting external input.
    Suspend {
        prompt_to_user: Value,
        next_input_type: String,
        message_id: String,
    },
    /// Workflow yields; the async coordinator runs a handler matching
    /// `task_id`.
    Async {
        task_id: String,
        timeout_ms: u64,
        task_args: Value,
        immediate_data: Value,
    },
    /// Workflow terminates with `value` as its final output.
    Finish(Value),
    /// The step failed; the retry policy may re-run it.
    Fail(StepFailure),
}

/// Carries enough structured context about a step failure for the retry
/// policy and execution history to reason about it.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub message: String,
    /// Coarse classification used by `RetryPolicy::retry_on`/`abort_on`
    /// (e.g. "timeout", "io", "validation", or a step-chosen tag).
    pub kind: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: "generic".to_string(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

impl From<WorkflowError> for StepFailure {
    fn from(err: WorkflowError) -> Self {
        StepFailure::new(err.to_string())
    }
}

impl StepResult {
    pub fn continue_with(value: Value) -> Self {
        StepResult::Continue(value)
    }

    pub fn branch(payload_type: impl Into<String>, value: Value) -> Self {
        StepResult::Branch {
            payload_type: payload_type.into(),
            value,
        }
    }

    pub fn finish(value: Value) -> Self {
        StepResult::Finish(value)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        StepResult::Fail(StepFailure::new(message))
    }

    /// A human-readable discriminant, used in logging and history records.
    pub fn variant_name(&self) -> &'static str {
        match self {
            StepResult::Continue(_) => "Continue",
            StepResult::Branch { .. } => "Branch",
            StepResult::Suspend { .. } => "Suspend",
            StepResult::Async { .. } => "Async",
            StepResult::Finish(_) => "Finish",
            StepResult::Fail(_) => "Fail",
        }
    }
}

/// Async, boxed step executor function: `(input, context) -> StepResult`.
///
/// Mirrors the `NodeExecutor` shape in `langgraph-core::graph`, generalized
/// to take the typed [`WorkflowContext`] and to return the closed
/// [`StepResult`] variant instead of a bare next-state value.
pub type StepExecutor = Arc<
    dyn Fn(
            Value,
            WorkflowContext,
        ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepFailure>> + Send>>
        + Send
        + Sync,
>;

/// Build a [`StepExecutor`] from an `async fn(Value, WorkflowContext) ->
/// Result<StepResult, StepFailure>`-shaped closure.
pub fn step_fn<F, Fut>(f: F) -> StepExecutor
where
    F: Fn(Value, WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult, StepFailure>> + Send + 'static,
{
    Arc::new(move |input, ctx| Box::pin(f(input, ctx)))
}
