//! Durable runtime state — §3: `WorkflowInstance`, `StepExecutionRecord`,
//! `SuspensionData`, `AsyncStepState`, and the instance status state
//! machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::WorkflowContext;

/// Lifecycle status of a [`WorkflowInstance`] (§4.4 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Failed,
}

/// One entry in a [`WorkflowInstance`]'s execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_id: String,
    pub input: Value,
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub error: Option<String>,
}

/// Error detail recorded on a `FAILED` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub step_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Durable, mutable per-execution state (§3 WorkflowInstance).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: String,
    pub chat_id: Option<String>,
    pub workflow_id: String,
    pub workflow_version: String,
    pub status: InstanceStatus,
    pub current_step_id: Option<String>,
    pub execution_history: Vec<StepExecutionRecord>,
    /// Flattened snapshot of the workflow context's key/value bag and
    /// per-step outputs, kept in sync by the engine after every transition
    /// so a cold-started engine can rehydrate a full [`WorkflowContext`].
    pub context_values: HashMap<String, Value>,
    pub step_outputs: HashMap<String, Value>,
    pub error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conventional context key under which `execute`'s `input` is seeded.
pub const TRIGGER_DATA_KEY: &str = "triggerData";

impl WorkflowInstance {
    pub fn new(
        instance_id: impl Into<String>,
        chat_id: Option<String>,
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        initial_step_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            chat_id,
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            status: InstanceStatus::Created,
            current_step_id: Some(initial_step_id.into()),
            execution_history: Vec::new(),
            context_values: HashMap::new(),
            step_outputs: HashMap::new(),
            error_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Build a [`WorkflowContext`] reflecting this instance's persisted
    /// key/value bag and step outputs — used to rehydrate context after a
    /// cold engine restart or across a suspend/resume boundary.
    pub fn to_context(&self) -> WorkflowContext {
        let mut ctx = WorkflowContext::new(self.instance_id.clone(), self.chat_id.clone());
        for (k, v) in &self.context_values {
            ctx.set(k.clone(), v.clone());
        }
        for (step_id, output) in &self.step_outputs {
            ctx.record_step_output(step_id.clone(), output.clone());
        }
        ctx
    }

    /// Persist the mutated context back onto the instance's flattened
    /// snapshot fields.
    pub fn absorb_context(&mut self, ctx: &WorkflowContext) {
        self.context_values = ctx.values().clone();
        self.step_outputs = ctx.step_outputs().clone();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, InstanceStatus::Completed | InstanceStatus::Failed)
    }
}

/// Durable record of an outstanding suspension (§3 SuspensionData). At most
/// one exists per instance while `status == SUSPENDED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionData {
    pub instance_id: String,
    /// Globally unique; doubles as the chat response id in §4.7.
    pub message_id: String,
    pub prompt_to_user: Value,
    pub next_input_type: String,
    pub suspended_step_id: String,
    pub created_at: DateTime<Utc>,
}

impl SuspensionData {
    pub fn new(
        instance_id: impl Into<String>,
        message_id: impl Into<String>,
        prompt_to_user: Value,
        next_input_type: impl Into<String>,
        suspended_step_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            message_id: message_id.into(),
            prompt_to_user,
            next_input_type: next_input_type.into(),
            suspended_step_id: suspended_step_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Durable, keyed-by-`message_id` async step record (§3 AsyncStepState).
///
/// Invariant: `completed ⇒ percent_complete == 100 ∧ (result_data.is_some()
/// ∨ error.is_some())`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncStepState {
    pub message_id: String,
    pub instance_id: String,
    pub step_id: String,
    pub task_id: String,
    pub task_args: Value,
    pub initial_data: Value,
    pub result_data: Option<Value>,
    /// Which `StepResult` variant `result_data` came from — `"Continue"`,
    /// `"Branch"`, or `"Finish"` — so the engine can resume the run loop
    /// "using the handler's StepResult as if it were the triggering step's
    /// result" (§4.6) instead of guessing from the shape of the value.
    pub result_kind: Option<String>,
    /// Populated alongside `result_kind == "Branch"`: the payload type tag
    /// used for Branch-edge selection.
    pub branch_payload_type: Option<String>,
    pub percent_complete: u8,
    pub status_message: String,
    pub completed: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AsyncStepState {
    pub fn new(
        message_id: impl Into<String>,
        instance_id: impl Into<String>,
        step_id: impl Into<String>,
        task_id: impl Into<String>,
        task_args: Value,
        initial_data: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            instance_id: instance_id.into(),
            step_id: step_id.into(),
            task_id: task_id.into(),
            task_args,
            initial_data,
            result_data: None,
            result_kind: None,
            branch_payload_type: None,
            percent_complete: 0,
            status_message: String::new(),
            completed: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a progress update, clamping `percent` to the previous maximum
    /// so progress is monotonic non-decreasing (§5, §8).
    pub fn apply_progress(&mut self, percent: u8, message: impl Into<String>) {
        self.percent_complete = self.percent_complete.max(percent.min(100));
        self.status_message = message.into();
        self.updated_at = Utc::now();
    }

    pub fn complete_with_result(&mut self, result: Value) {
        self.result_data = Some(result);
        self.percent_complete = 100;
        self.completed = true;
        self.updated_at = Utc::now();
    }

    /// Complete with the exact `StepResult` variant the handler returned, so
    /// the engine can resume run-loop edge selection faithfully.
    pub fn complete_with_step_result(
        &mut self,
        kind: impl Into<String>,
        branch_payload_type: Option<String>,
        result: Value,
    ) {
        self.result_kind = Some(kind.into());
        self.branch_payload_type = branch_payload_type;
        self.complete_with_result(result);
    }

    pub fn complete_with_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.percent_complete = 100;
        self.completed = true;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_is_monotonic_non_decreasing() {
        let mut state = AsyncStepState::new("m1", "i1", "s1", "t1", json!({}), json!({}));
        state.apply_progress(25, "Analyzing");
        state.apply_progress(10, "regressed");
        assert_eq!(state.percent_complete, 25);
        state.apply_progress(75, "Processing");
        assert_eq!(state.percent_complete, 75);
    }

    #[test]
    fn completion_sets_invariant_fields() {
        let mut state = AsyncStepState::new("m1", "i1", "s1", "t1", json!({}), json!({}));
        state.complete_with_result(json!({"ok": true}));
        assert!(state.completed);
        assert_eq!(state.percent_complete, 100);
        assert!(state.result_data.is_some());
    }

    #[test]
    fn context_round_trips_through_instance_snapshot() {
        let mut instance =
            WorkflowInstance::new("i1", None, "wf", "1.0.0", "initial");
        let mut ctx = instance.to_context();
        ctx.set(TRIGGER_DATA_KEY, json!({"x": 1}));
        ctx.record_step_output("initial", json!({"y": 2}));
        instance.absorb_context(&ctx);
        let rehydrated = instance.to_context();
        assert_eq!(
            rehydrated.get(TRIGGER_DATA_KEY).cloned(),
            Some(json!({"x": 1}))
        );
        assert_eq!(
            rehydrated.step("initial").output::<Value>().unwrap(),
            json!({"y": 2})
        );
    }
}
