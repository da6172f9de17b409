//! Engine-wide tunables — SPEC_FULL.md §2.1 ambient configuration surface.
//!
//! Plain structs with `Default` impls and chainable `with_*` setters, the
//! same shape `RetryPolicy`'s builder methods use, rather than an external
//! config-file loader (out of scope per spec.md §1).

use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;

/// Tunables for [`crate::engine::WorkflowEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the bounded worker pool that advances per-instance run loops
    /// concurrently (§5: "Across instances the engine runs on a bounded
    /// worker pool").
    pub run_loop_workers: usize,
    /// Default circuit-breaker configuration applied to a step id that has
    /// not been explicitly configured.
    pub default_circuit_breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_loop_workers: 16,
            default_circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_run_loop_workers(mut self, workers: usize) -> Self {
        self.run_loop_workers = workers;
        self
    }

    pub fn with_default_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_circuit_breaker = config;
        self
    }
}

/// Tunables for [`crate::async_coordinator::AsyncCoordinator`].
#[derive(Debug, Clone)]
pub struct AsyncCoordinatorConfig {
    /// Size of the bounded worker pool that runs async handlers (§4.6,
    /// §5: "a separate bounded pool owned by the coordinator so that a
    /// saturated handler pool cannot starve the run loop").
    pub worker_count: usize,
}

impl Default for AsyncCoordinatorConfig {
    fn default() -> Self {
        Self { worker_count: 8 }
    }
}

impl AsyncCoordinatorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

/// Polling cadence used by `waitForTerminalState`-style callers.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            // §4.7: "a configurable cap (default ~100s)".
            timeout: Duration::from_secs(100),
        }
    }
}

impl PollingConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
