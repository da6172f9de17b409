//! Workflow context — §9 "Context propagation into step functions".
//!
//! The engine passes `(input, WorkflowContext)` to every step. The context
//! exposes a typed key/value store plus typed step-output lookup
//! (`step(id).output::<T>()`). This is a capability object handed to each
//! invocation, not ambient/global state — grounded on
//! `langgraph-core::managed::ExecutionContext`, generalized from "managed
//! values for one superstep" to "key/value bag plus per-step outputs for
//! one workflow instance".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// Capability handed to async handlers to stream progress back into
/// `AsyncStepState` (§4.6 `AsyncProgressReporter`). Defined as a trait here,
/// rather than a concrete type, so `WorkflowContext` does not need to depend
/// on the persistence port its one implementation (in
/// `crate::async_coordinator`) is backed by.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn update_progress(&self, percent: u8, message: String);
}

/// Per-instance key/value bag and typed step-output store passed to every
/// step invocation.
#[derive(Clone, Default)]
pub struct WorkflowContext {
    values: HashMap<String, Value>,
    step_outputs: HashMap<String, Value>,
    pub instance_id: String,
    pub chat_id: Option<String>,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("instance_id", &self.instance_id)
            .field("chat_id", &self.chat_id)
            .field("values", &self.values)
            .field("step_outputs", &self.step_outputs)
            .finish()
    }
}

impl WorkflowContext {
    pub fn new(instance_id: impl Into<String>, chat_id: Option<String>) -> Self {
        Self {
            values: HashMap::new(),
            step_outputs: HashMap::new(),
            instance_id: instance_id.into(),
            chat_id,
            progress: None,
        }
    }

    /// Attach a progress reporter for this invocation only (used by the
    /// async coordinator before calling a handler; §4.6).
    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn progress(&self) -> Option<&Arc<dyn ProgressReporter>> {
        self.progress.as_ref()
    }

    /// Store an arbitrary keyed value in the context.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Fetch a raw value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Fetch and deserialize a typed value by key.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.values.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    /// Record the raw output produced by a completed step, addressable
    /// later via `step(id).output::<T>()`.
    pub fn record_step_output(&mut self, step_id: impl Into<String>, output: Value) {
        self.step_outputs.insert(step_id.into(), output);
    }

    /// Begin a typed lookup for a previously executed step's output.
    pub fn step<'a>(&'a self, step_id: &str) -> StepOutputView<'a> {
        StepOutputView {
            value: self.step_outputs.get(step_id),
            step_id: step_id.to_string(),
        }
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn step_outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }
}

/// View over one step's recorded output, supporting typed retrieval.
pub struct StepOutputView<'a> {
    value: Option<&'a Value>,
    step_id: String,
}

impl<'a> StepOutputView<'a> {
    /// Deserialize the step's output as `T`.
    pub fn output<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.value.ok_or_else(|| {
            WorkflowError::Custom(format!("no recorded output for step '{}'", self.step_id))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn raw(&self) -> Option<&Value> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize, PartialEq, Debug)]
    struct Assessment {
        level: String,
    }

    #[test]
    fn set_and_get_typed_value() {
        let mut ctx = WorkflowContext::new("i1", None);
        ctx.set("triggerData", json!({"level": "B1"}));
        let a: Assessment = ctx.get_typed("triggerData").unwrap().unwrap();
        assert_eq!(a.level, "B1");
    }

    #[test]
    fn step_output_round_trips() {
        let mut ctx = WorkflowContext::new("i1", None);
        ctx.record_step_output("check", json!({"level": "B1"}));
        let a: Assessment = ctx.step("check").output().unwrap();
        assert_eq!(a, Assessment { level: "B1".into() });
    }

    #[test]
    fn missing_step_output_errors() {
        let ctx = WorkflowContext::new("i1", None);
        let result: Result<Assessment> = ctx.step("missing").output();
        assert!(result.is_err());
    }
}
