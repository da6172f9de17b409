//! Circuit breaker — engine-global, keyed by step id, §4.4 / §8.
//!
//! Grounded on the `CircuitBreaker` in
//! `knhk-workflow-engine::resilience::circuit_breaker`, generalized from a
//! single-breaker-per-call-site struct into a registry keyed by step id
//! (§9 "make them explicitly owned by the engine value, not ambient") with
//! atomic `(state, counter)` transitions as spec.md §5 requires.
//!
//! State machine: `CLOSED -> OPEN` (after `failure_threshold` consecutive
//! failures) `-> HALF_OPEN` (after `open_duration` elapses) `-> CLOSED`
//! (after `success_threshold` successes in half-open) or back to `OPEN` on
//! any half-open failure. `half_open_max_attempts` bounds concurrent
//! half-open probes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Observable circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for one step's circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerRow {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl BreakerRow {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }
}

/// Admission decision returned by [`CircuitBreakerRegistry::try_admit`].
pub enum Admission {
    /// The call may proceed; `release` must be called when it finishes.
    Admitted,
    /// The breaker is open; the call must be short-circuited as a failure.
    Denied,
}

/// Registry of per-step circuit breakers, shared across all instances of
/// the engine (spec.md §5: "Circuit-breaker state is shared across
/// instances and requires atomic transitions").
pub struct CircuitBreakerRegistry {
    configs: DashMap<String, CircuitBreakerConfig>,
    rows: DashMap<String, Mutex<BreakerRow>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            configs: DashMap::new(),
            rows: DashMap::new(),
            default_config: CircuitBreakerConfig::default(),
        }
    }

    /// Use `default_config` for any step id that never calls [`configure`](Self::configure)
    /// (`EngineConfig::default_circuit_breaker`).
    pub fn with_default(mut self, default_config: CircuitBreakerConfig) -> Self {
        self.default_config = default_config;
        self
    }

    pub fn configure(&self, step_id: impl Into<String>, config: CircuitBreakerConfig) {
        self.configs.insert(step_id.into(), config);
    }

    fn config_for(&self, step_id: &str) -> CircuitBreakerConfig {
        self.configs
            .get(step_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Attempt to admit an invocation of `step_id`. On `HalfOpen`, this may
    /// be denied once `half_open_max_attempts` concurrent probes are
    /// already in flight.
    pub fn try_admit(&self, step_id: &str) -> Admission {
        let config = self.config_for(step_id);
        let row_lock = self
            .rows
            .entry(step_id.to_string())
            .or_insert_with(|| Mutex::new(BreakerRow::new()));
        let mut row = row_lock.lock();

        if row.state == CircuitState::Open {
            if let Some(opened_at) = row.opened_at {
                if opened_at.elapsed() >= config.open_duration {
                    row.state = CircuitState::HalfOpen;
                    row.half_open_successes = 0;
                    row.half_open_in_flight = 0;
                }
            }
        }

        match row.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => Admission::Denied,
            CircuitState::HalfOpen => {
                if row.half_open_in_flight >= config.half_open_max_attempts {
                    Admission::Denied
                } else {
                    row.half_open_in_flight += 1;
                    Admission::Admitted
                }
            }
        }
    }

    /// Record a successful invocation of `step_id` that was previously
    /// admitted.
    pub fn record_success(&self, step_id: &str) {
        let config = self.config_for(step_id);
        if let Some(row_lock) = self.rows.get(step_id) {
            let mut row = row_lock.lock();
            row.consecutive_failures = 0;
            match row.state {
                CircuitState::HalfOpen => {
                    row.half_open_in_flight = row.half_open_in_flight.saturating_sub(1);
                    row.half_open_successes += 1;
                    if row.half_open_successes >= config.success_threshold {
                        row.state = CircuitState::Closed;
                        row.half_open_successes = 0;
                        row.opened_at = None;
                    }
                }
                CircuitState::Closed | CircuitState::Open => {}
            }
        }
    }

    /// Record a failed invocation of `step_id` that was previously
    /// admitted.
    pub fn record_failure(&self, step_id: &str) {
        let config = self.config_for(step_id);
        let row_lock = self
            .rows
            .entry(step_id.to_string())
            .or_insert_with(|| Mutex::new(BreakerRow::new()));
        let mut row = row_lock.lock();
        match row.state {
            CircuitState::HalfOpen => {
                row.half_open_in_flight = row.half_open_in_flight.saturating_sub(1);
                row.state = CircuitState::Open;
                row.opened_at = Some(Instant::now());
                row.half_open_successes = 0;
            }
            CircuitState::Closed => {
                row.consecutive_failures += 1;
                if row.consecutive_failures >= config.failure_threshold {
                    row.state = CircuitState::Open;
                    row.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state_of(&self, step_id: &str) -> CircuitState {
        self.rows
            .get(step_id)
            .map(|row| row.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of every step's current state, for introspection.
    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        self.rows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().state))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
