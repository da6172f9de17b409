//! Async coordinator — §4.6.
//!
//! Runs async handlers on a bounded worker pool separate from the run-loop
//! pool (§5: "so that a saturated handler pool cannot starve the run
//! loop"), matches an incoming `task_id` against registered glob patterns,
//! and streams progress back through [`crate::context::ProgressReporter`].
//! Grounded on `orchestrator`'s `pattern.rs`/`selector.rs` use of `regex`
//! for routing (SPEC_FULL.md §4.6), with a `tokio::sync::Semaphore`-gated
//! spawn per dispatched handler, the same worker-pool shape
//! `orca`'s concurrency tests exercise.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;

use crate::config::AsyncCoordinatorConfig;
use crate::context::{ProgressReporter, WorkflowContext};
use crate::error::{Result, WorkflowError};
use crate::event::EventPublisher;
use crate::graph::AsyncHandlerSpec;
use crate::instance::AsyncStepState;
use crate::persistence::AsyncStepStateRepository;
use crate::step::{StepExecutor, StepResult};

/// Writes progress updates through to the durable [`AsyncStepState`] row,
/// clamped to monotonic non-decreasing `percent` by
/// `AsyncStepState::apply_progress` itself, and fans the same update out to
/// any registered [`EventPublisher`]s.
pub struct AsyncProgressReporter {
    async_steps: Arc<dyn AsyncStepStateRepository>,
    message_id: String,
    publishers: Vec<Arc<dyn EventPublisher>>,
}

#[async_trait::async_trait]
impl ProgressReporter for AsyncProgressReporter {
    async fn update_progress(&self, percent: u8, message: String) {
        if let Ok(Some(mut state)) = self.async_steps.find_by_message_id(&self.message_id).await {
            state.apply_progress(percent, message.clone());
            let _ = self.async_steps.update(state).await;
        }
        for publisher in &self.publishers {
            publisher
                .publish_async_progress(&self.message_id, percent, &message)
                .await;
        }
    }
}

/// Emitted when a dispatched handler finishes (success, failure, or
/// timeout) and its terminal [`AsyncStepState`] has been persisted. The
/// engine consumes these to resume the instance's run loop (§4.6: "The
/// engine observes completion... and resumes the run loop using the
/// handler's StepResult as if it were the triggering step's result").
#[derive(Debug, Clone)]
pub struct AsyncCompletion {
    pub instance_id: String,
    pub message_id: String,
}

/// Translate the spec's `*`-substring glob (§3: "non-empty glob") into an
/// anchored regex.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let escaped_parts: Vec<String> = pattern.split('*').map(regex::escape).collect();
    Regex::new(&format!("^{}$", escaped_parts.join(".*")))
}

/// Number of non-wildcard characters in `pattern` — the specificity measure
/// §4.6 uses to pick a winner among several matching patterns.
fn specificity(pattern: &str) -> usize {
    pattern.chars().filter(|&c| c != '*').count()
}

/// Registry of `task_id` glob → handler, plus a bounded worker pool that
/// runs matched handlers outside the run loop.
pub struct AsyncCoordinator {
    semaphore: Arc<Semaphore>,
    async_steps: Arc<dyn AsyncStepStateRepository>,
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl AsyncCoordinator {
    pub fn new(
        config: AsyncCoordinatorConfig,
        async_steps: Arc<dyn AsyncStepStateRepository>,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.worker_count.max(1))),
            async_steps,
            publishers: Vec::new(),
        }
    }

    pub fn with_publishers(mut self, publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        self.publishers = publishers;
        self
    }

    /// Match `task_id` against `handlers` (§4.6: "most specific wins; ties
    /// broken by registration order").
    pub fn match_handler<'a>(
        handlers: &'a [AsyncHandlerSpec],
        task_id: &str,
    ) -> Option<&'a AsyncHandlerSpec> {
        handlers
            .iter()
            .enumerate()
            .filter_map(|(idx, spec)| {
                glob_to_regex(&spec.pattern)
                    .ok()
                    .filter(|re| re.is_match(task_id))
                    .map(|_| (idx, spec))
            })
            .max_by_key(|(idx, spec)| (specificity(&spec.pattern), std::cmp::Reverse(*idx)))
            .map(|(_, spec)| spec)
    }

    /// Dispatch `state`'s declared `task_id` to its matching handler on the
    /// bounded worker pool. Returns once the task has been scheduled, not
    /// once it completes; `completion_tx` receives an [`AsyncCompletion`]
    /// when the handler's terminal result has been persisted.
    pub async fn dispatch(
        &self,
        handlers: &[AsyncHandlerSpec],
        state: AsyncStepState,
        timeout_ms: u64,
        ctx: WorkflowContext,
        completion_tx: UnboundedSender<AsyncCompletion>,
    ) -> Result<()> {
        let handler: StepExecutor = Self::match_handler(handlers, &state.task_id)
            .ok_or_else(|| WorkflowError::AsyncHandlerMissing(state.task_id.clone()))?
            .handler
            .clone();

        let async_steps = self.async_steps.clone();
        let semaphore = self.semaphore.clone();
        let message_id = state.message_id.clone();
        let instance_id = state.instance_id.clone();
        let task_args = state.task_args.clone();
        let reporter: Arc<dyn ProgressReporter> = Arc::new(AsyncProgressReporter {
            async_steps: async_steps.clone(),
            message_id: message_id.clone(),
            publishers: self.publishers.clone(),
        });
        let ctx = ctx.with_progress(reporter);

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let invocation = (handler)(task_args, ctx);
            let outcome = if timeout_ms > 0 {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), invocation).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::step::StepFailure::new(format!(
                        "async handler timed out for task id '{}' after {timeout_ms}ms",
                        state.task_id
                    ))
                    .with_kind("timeout")),
                }
            } else {
                invocation.await
            };

            if let Ok(Some(mut current)) = async_steps.find_by_message_id(&message_id).await {
                match outcome {
                    Ok(StepResult::Finish(value)) => {
                        current.complete_with_step_result("Finish", None, value)
                    }
                    Ok(StepResult::Continue(value)) => {
                        current.complete_with_step_result("Continue", None, value)
                    }
                    Ok(StepResult::Branch { payload_type, value }) => {
                        current.complete_with_step_result("Branch", Some(payload_type), value)
                    }
                    Ok(StepResult::Fail(failure)) => current.complete_with_error(failure.message),
                    Ok(other) => current.complete_with_error(format!(
                        "async handler returned unsupported result '{}'",
                        other.variant_name()
                    )),
                    Err(failure) => current.complete_with_error(failure.message),
                }
                let _ = async_steps.update(current).await;
            }
            let _ = completion_tx.send(AsyncCompletion {
                instance_id,
                message_id,
            });
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAsyncStepStateRepository;
    use crate::step::{step_fn, StepResult as SR};
    use serde_json::json;

    fn handler_spec(pattern: &str) -> AsyncHandlerSpec {
        AsyncHandlerSpec {
            pattern: pattern.to_string(),
            handler: step_fn(|input, _ctx| async move { Ok(SR::finish(input)) }),
        }
    }

    #[test]
    fn exact_pattern_matches() {
        let handlers = vec![handler_spec("processDataAsync")];
        let matched = AsyncCoordinator::match_handler(&handlers, "processDataAsync");
        assert!(matched.is_some());
    }

    #[test]
    fn most_specific_pattern_wins() {
        let handlers = vec![handler_spec("process*"), handler_spec("processData*")];
        let matched = AsyncCoordinator::match_handler(&handlers, "processDataAsync").unwrap();
        assert_eq!(matched.pattern, "processData*");
    }

    #[test]
    fn ties_broken_by_registration_order() {
        // Both patterns have 2 literal chars and both match "abc"; the
        // first-registered one should win the tie.
        let handlers = vec![handler_spec("*bc"), handler_spec("a*c")];
        let matched = AsyncCoordinator::match_handler(&handlers, "abc");
        assert_eq!(matched.unwrap().pattern, "*bc");
    }

    #[tokio::test]
    async fn dispatch_runs_handler_and_notifies_completion() {
        let repo = Arc::new(InMemoryAsyncStepStateRepository::new());
        let coordinator = AsyncCoordinator::new(AsyncCoordinatorConfig::default(), repo.clone());
        let state = AsyncStepState::new(
            "m1",
            "i1",
            "start",
            "processDataAsync",
            json!({"data": "go"}),
            json!({}),
        );
        repo.save(state.clone()).await.unwrap();
        let handlers = vec![handler_spec("processDataAsync")];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        coordinator
            .dispatch(&handlers, state, 0, WorkflowContext::new("i1", None), tx)
            .await
            .unwrap();
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.message_id, "m1");
        let final_state = repo.find_by_message_id("m1").await.unwrap().unwrap();
        assert!(final_state.completed);
        assert_eq!(final_state.result_kind.as_deref(), Some("Finish"));
    }

    #[tokio::test]
    async fn missing_handler_errors() {
        let repo = Arc::new(InMemoryAsyncStepStateRepository::new());
        let coordinator = AsyncCoordinator::new(AsyncCoordinatorConfig::default(), repo.clone());
        let state = AsyncStepState::new("m1", "i1", "start", "unknownTask", json!({}), json!({}));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = coordinator
            .dispatch(&[], state, 0, WorkflowContext::new("i1", None), tx)
            .await;
        assert!(matches!(result, Err(WorkflowError::AsyncHandlerMissing(_))));
    }
}
