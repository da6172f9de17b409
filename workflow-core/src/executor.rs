//! Step executor — §4.5.
//!
//! Wraps a single step invocation: enforce circuit breaker admission →
//! enforce invocation limit → run with the retry loop → return a
//! normalized [`StepResult`] or a terminal `Fail`. Records each attempt with
//! timing. Never mutates `WorkflowInstance.status` — that stays the
//! engine's responsibility (§4.5: "Never mutates WorkflowInstance status
//! directly").
//!
//! Grounded on `langgraph-core::retry`'s attempt-loop shape, generalized to
//! additionally gate on the per-step [`CircuitBreakerRegistry`] (from
//! `knhk-workflow-engine::resilience`) and an invocation-count cap before
//! each attempt.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::circuit_breaker::{Admission, CircuitBreakerRegistry};
use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::graph::{OnInvocationsLimit, StepNode};
use crate::instance::StepExecutionRecord;
use crate::step::{StepFailure, StepResult};

/// Shared, engine-owned runtime state the executor needs across every step
/// invocation of every instance: circuit breakers (global per step id) and
/// invocation counters (per instance *and* step id, since the limit guards
/// one instance's loop, not the step globally).
pub struct ExecutorRuntime {
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    invocation_counts: DashMap<(String, String), u32>,
    last_outputs: DashMap<(String, String), Value>,
}

impl ExecutorRuntime {
    pub fn new(circuit_breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            circuit_breakers,
            invocation_counts: DashMap::new(),
            last_outputs: DashMap::new(),
        }
    }

    fn bump_invocation_count(&self, instance_id: &str, step_id: &str) -> u32 {
        let key = (instance_id.to_string(), step_id.to_string());
        let mut entry = self.invocation_counts.entry(key).or_insert(0);
        *entry += 1;
        *entry
    }

    fn last_output(&self, instance_id: &str, step_id: &str) -> Option<Value> {
        self.last_outputs
            .get(&(instance_id.to_string(), step_id.to_string()))
            .map(|v| v.clone())
    }

    fn record_output(&self, instance_id: &str, step_id: &str, value: Value) {
        self.last_outputs
            .insert((instance_id.to_string(), step_id.to_string()), value);
    }
}

/// Outcome of executing one step to completion (possibly after several
/// retried attempts): the normalized result plus an execution-history entry
/// per attempt.
pub struct StepExecution {
    pub result: Result<StepResult>,
    pub attempts: Vec<StepExecutionRecord>,
}

/// Execute `node` once to completion, retrying per its declared policy.
pub async fn execute_step(
    runtime: &ExecutorRuntime,
    instance_id: &str,
    node: &StepNode,
    input: Value,
    ctx: WorkflowContext,
) -> StepExecution {
    let mut attempts = Vec::new();

    // Circuit breaker admission (§4.4, §4.5: checked before the invocation
    // limit so a denied call never counts against it).
    if matches!(runtime.circuit_breakers.try_admit(&node.id), Admission::Denied) {
        return StepExecution {
            result: Err(WorkflowError::CircuitOpen {
                step_id: node.id.clone(),
            }),
            attempts,
        };
    }

    // Invocation limit (§3 StepNode policies).
    let count = runtime.bump_invocation_count(instance_id, &node.id);
    if let Some(limit) = node.policies.invocation_limit {
        if count > limit {
            let outcome = match node.policies.on_invocations_limit {
                Some(OnInvocationsLimit::FinishWithLastOutput) => {
                    let last = runtime
                        .last_output(instance_id, &node.id)
                        .unwrap_or(Value::Null);
                    Ok(StepResult::Finish(last))
                }
                _ => Err(WorkflowError::step_failure(
                    &node.id,
                    format!("invocation limit ({limit}) exceeded"),
                )),
            };
            return StepExecution {
                result: outcome,
                attempts,
            };
        }
    }

    let policy = node.policies.retry.clone().unwrap_or_default();
    let timeout = node.policies.timeout();

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let started_at = Utc::now();
        let clock = Instant::now();

        let invocation = (node.executor)(input.clone(), ctx.clone());
        let raw_outcome = match timeout {
            Some(duration) => match tokio::time::timeout(duration, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    runtime.circuit_breakers.record_failure(&node.id);
                    attempts.push(StepExecutionRecord {
                        step_id: node.id.clone(),
                        input: input.clone(),
                        output: None,
                        started_at,
                        finished_at: Some(Utc::now()),
                        attempt,
                        error: Some(format!("timed out after {}ms", duration.as_millis())),
                    });
                    if policy.should_retry(attempt, "timeout") {
                        tokio::time::sleep(policy.calculate_delay(attempt)).await;
                        continue;
                    }
                    return StepExecution {
                        result: Err(WorkflowError::StepTimeout {
                            step_id: node.id.clone(),
                            duration_ms: duration.as_millis() as u64,
                        }),
                        attempts,
                    };
                }
            },
            None => invocation.await,
        };

        match raw_outcome {
            // A thrown executor-level error: retried per `retryOn`/`abortOn`
            // ("empty = all", §4.4) regardless of `retry_on_fail_result`,
            // which only governs a step-local `Fail` *result* (§9b).
            Err(failure) => {
                runtime.circuit_breakers.record_failure(&node.id);
                attempts.push(StepExecutionRecord {
                    step_id: node.id.clone(),
                    input: input.clone(),
                    output: None,
                    started_at,
                    finished_at: Some(Utc::now()),
                    attempt,
                    error: Some(failure.message.clone()),
                });
                let _ = clock.elapsed();
                if policy.should_retry(attempt, &failure.kind) {
                    tokio::time::sleep(policy.calculate_delay(attempt)).await;
                    continue;
                }
                return StepExecution {
                    result: Ok(StepResult::Fail(failure)),
                    attempts,
                };
            }
            Ok(StepResult::Fail(failure)) => {
                runtime.circuit_breakers.record_failure(&node.id);
                attempts.push(StepExecutionRecord {
                    step_id: node.id.clone(),
                    input: input.clone(),
                    output: None,
                    started_at,
                    finished_at: Some(Utc::now()),
                    attempt,
                    error: Some(failure.message.clone()),
                });
                let _ = clock.elapsed();
                if !policy.retry_on_fail_result {
                    return StepExecution {
                        result: Ok(StepResult::Fail(failure)),
                        attempts,
                    };
                }
                if policy.should_retry(attempt, &failure.kind) {
                    tokio::time::sleep(policy.calculate_delay(attempt)).await;
                    continue;
                }
                return StepExecution {
                    result: Ok(StepResult::Fail(failure)),
                    attempts,
                };
            }
            Ok(success) => {
                runtime.circuit_breakers.record_success(&node.id);
                let output_value = match &success {
                    StepResult::Continue(v) | StepResult::Branch { value: v, .. } | StepResult::Finish(v) => {
                        Some(v.clone())
                    }
                    _ => None,
                };
                if let Some(v) = output_value.clone() {
                    runtime.record_output(instance_id, &node.id, v);
                }
                attempts.push(StepExecutionRecord {
                    step_id: node.id.clone(),
                    input: input.clone(),
                    output: output_value,
                    started_at,
                    finished_at: Some(Utc::now()),
                    attempt,
                    error: None,
                });
                return StepExecution {
                    result: Ok(success),
                    attempts,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{StepPolicies, TypeDescriptor};
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn node_with(executor: crate::step::StepExecutor, policies: StepPolicies) -> StepNode {
        StepNode {
            id: "s1".to_string(),
            description: None,
            is_initial: true,
            is_async: false,
            input_type: TypeDescriptor::from("Input"),
            output_type: TypeDescriptor::from("Output"),
            executor,
            policies,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let runtime = ExecutorRuntime::new(Arc::new(CircuitBreakerRegistry::new()));
        let node = node_with(
            crate::step::step_fn(|input, _ctx| async move { Ok(StepResult::Continue(input)) }),
            StepPolicies::default(),
        );
        let outcome = execute_step(&runtime, "i1", &node, json!(1), WorkflowContext::new("i1", None)).await;
        assert!(matches!(outcome.result, Ok(StepResult::Continue(_))));
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let executor = crate::step::step_fn(move |input, _ctx| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Ok(StepResult::Fail(StepFailure::new("transient")))
                } else {
                    Ok(StepResult::Continue(input))
                }
            }
        });
        let policies = StepPolicies {
            retry: Some(RetryPolicy::new(5).with_delay_ms(1).with_jitter_factor(0.0)),
            ..Default::default()
        };
        let runtime = ExecutorRuntime::new(Arc::new(CircuitBreakerRegistry::new()));
        let node = node_with(executor, policies);
        let outcome = execute_step(&runtime, "i1", &node, json!(1), WorkflowContext::new("i1", None)).await;
        assert!(matches!(outcome.result, Ok(StepResult::Continue(_))));
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn thrown_error_retries_per_retry_on_even_when_retry_on_fail_result_is_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let executor = crate::step::step_fn(move |input, _ctx| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StepFailure::new("transient"))
                } else {
                    Ok(StepResult::Continue(input))
                }
            }
        });
        let policies = StepPolicies {
            retry: Some(
                RetryPolicy::new(5)
                    .with_delay_ms(1)
                    .with_jitter_factor(0.0)
                    .with_retry_on_fail_result(false),
            ),
            ..Default::default()
        };
        let runtime = ExecutorRuntime::new(Arc::new(CircuitBreakerRegistry::new()));
        let node = node_with(executor, policies);
        let outcome = execute_step(&runtime, "i1", &node, json!(1), WorkflowContext::new("i1", None)).await;
        assert!(matches!(outcome.result, Ok(StepResult::Continue(_))));
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test]
    async fn fail_result_is_not_retried_when_retry_on_fail_result_is_false() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let executor = crate::step::step_fn(move |_input, _ctx| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(StepResult::Fail(StepFailure::new("nope")))
            }
        });
        let policies = StepPolicies {
            retry: Some(
                RetryPolicy::new(5)
                    .with_delay_ms(1)
                    .with_jitter_factor(0.0)
                    .with_retry_on_fail_result(false),
            ),
            ..Default::default()
        };
        let runtime = ExecutorRuntime::new(Arc::new(CircuitBreakerRegistry::new()));
        let node = node_with(executor, policies);
        let outcome = execute_step(&runtime, "i1", &node, json!(1), WorkflowContext::new("i1", None)).await;
        assert!(matches!(outcome.result, Ok(StepResult::Fail(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test]
    async fn invocation_limit_finishes_with_last_output() {
        let executor = crate::step::step_fn(|input, _ctx| async move { Ok(StepResult::Continue(input)) });
        let policies = StepPolicies {
            invocation_limit: Some(1),
            on_invocations_limit: Some(OnInvocationsLimit::FinishWithLastOutput),
            ..Default::default()
        };
        let runtime = ExecutorRuntime::new(Arc::new(CircuitBreakerRegistry::new()));
        let node = node_with(executor, policies);
        let _ = execute_step(&runtime, "i1", &node, json!("first"), WorkflowContext::new("i1", None)).await;
        let second = execute_step(&runtime, "i1", &node, json!("second"), WorkflowContext::new("i1", None)).await;
        match second.result {
            Ok(StepResult::Finish(v)) => assert_eq!(v, json!("first")),
            other => panic!("unexpected: {:?}", other.map(|r| r.variant_name())),
        }
    }

    #[tokio::test]
    async fn open_circuit_denies_invocation() {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        breakers.configure(
            "s1",
            crate::circuit_breaker::CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                open_duration: std::time::Duration::from_secs(60),
                half_open_max_attempts: 1,
            },
        );
        breakers.try_admit("s1");
        breakers.record_failure("s1");
        let runtime = ExecutorRuntime::new(breakers);
        let node = node_with(
            crate::step::step_fn(|input, _ctx| async move { Ok(StepResult::Continue(input)) }),
            StepPolicies::default(),
        );
        let outcome = execute_step(&runtime, "i1", &node, json!(1), WorkflowContext::new("i1", None)).await;
        assert!(matches!(outcome.result, Err(WorkflowError::CircuitOpen { .. })));
    }
}
