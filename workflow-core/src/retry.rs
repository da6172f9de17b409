//! Retry policy — exponential backoff with jitter, §4.4.
//!
//! Grounded on `langgraph-core::retry::RetryPolicy`'s builder shape, adapted
//! to the fields spec.md §4.4 names: `max_attempts`, `delay`,
//! `backoff_multiplier`, `max_delay`, `jitter_factor`, `retry_on`,
//! `abort_on`, `retry_on_fail_result`.
//!
//! Delay formula (spec.md §4.4): `min(max_delay, delay * multiplier^(attempt-1))`,
//! then perturbed by a uniform jitter factor on `[1 - jitter_factor, 1 + jitter_factor]`.

use rand::Rng;
use std::time::Duration;

/// Per-step retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    /// Failure-kind tags this policy retries on. Empty means "retry on
    /// all kinds" per spec.md §4.4.
    pub retry_on: Vec<String>,
    /// Failure-kind tags that abort immediately, taking precedence over
    /// `retry_on`.
    pub abort_on: Vec<String>,
    /// Whether a step-local `Fail` result (as opposed to an executor-level
    /// error) is itself retryable. Resolved Open Question (spec.md §9b):
    /// `Fail` is retryable iff this is true, regardless of the embedded
    /// failure kind.
    pub retry_on_fail_result: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            retry_on: Vec::new(),
            abort_on: Vec::new(),
            retry_on_fail_result: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_retry_on(mut self, kinds: Vec<String>) -> Self {
        self.retry_on = kinds;
        self
    }

    pub fn with_abort_on(mut self, kinds: Vec<String>) -> Self {
        self.abort_on = kinds;
        self
    }

    pub fn with_retry_on_fail_result(mut self, value: bool) -> Self {
        self.retry_on_fail_result = value;
        self
    }

    /// `attempt` is 1-based (the attempt that just failed). Returns whether
    /// another attempt should be made given the failure `kind`.
    pub fn should_retry(&self, attempt: u32, kind: &str) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if self.abort_on.iter().any(|k| k == kind) {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        self.retry_on.iter().any(|k| k == kind)
    }

    /// Compute the delay before the next attempt, given the 1-based attempt
    /// number that just failed (so `attempt=1` is the delay before the
    /// 2nd attempt).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let raw = self.delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        let jittered = if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range((1.0 - self.jitter_factor)..=(1.0 + self.jitter_factor));
            capped * factor
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Mutable tracker for attempts made so far against one step invocation.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, error: Option<String>) {
        self.attempts += 1;
        self.last_error = error;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }
}
