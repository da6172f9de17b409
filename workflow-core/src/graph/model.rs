//! Graph data model — §3: `WorkflowGraph`, `StepNode`, `Edge`,
//! `AsyncHandlerSpec`, and the per-step policy bag.
//!
//! Grounded on `langgraph-core::graph::{Graph, NodeSpec, Edge}`, generalized
//! from langgraph's two edge kinds (`Direct`, `Conditional`) to the four
//! this crate needs (`Sequential`, `Branch`, `Conditional`, `Error`), and
//! from `TypeId`-based payload matching (not expressible without reflection)
//! to a named `TypeDescriptor` schema tag so a graph stays (de)serializable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;
use crate::step::StepExecutor;

/// A schema name used to tag the structural type of a step's input/output
/// or an edge's payload (the Rust stand-in for reflected `Class<?>` in
/// spec.md §4.2, since there is no runtime `TypeId` registry here).
pub type TypeDescriptor = String;

pub type StepId = String;

/// What to do when a step's `invocationLimit` is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnInvocationsLimit {
    /// Fail the step (and, absent a retry, the instance).
    Fail,
    /// Treat the limit as a `Finish` with the step's last successful output.
    FinishWithLastOutput,
}

/// Per-step policies (§3 StepNode: `retry`, `invocationLimit`,
/// `onInvocationsLimit`, `timeoutMs`, plus a per-step circuit breaker
/// override — §4.4/§8 scenario 5. A step that declares none uses the
/// engine's configured default (`EngineConfig::default_circuit_breaker`).
#[derive(Debug, Clone, Default)]
pub struct StepPolicies {
    pub retry: Option<RetryPolicy>,
    pub invocation_limit: Option<u32>,
    pub on_invocations_limit: Option<OnInvocationsLimit>,
    pub timeout_ms: Option<u64>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl StepPolicies {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A single executable node in a [`WorkflowGraph`] (§3 StepNode).
#[derive(Clone)]
pub struct StepNode {
    pub id: StepId,
    pub description: Option<String>,
    pub is_initial: bool,
    pub is_async: bool,
    pub input_type: TypeDescriptor,
    pub output_type: TypeDescriptor,
    pub executor: StepExecutor,
    pub policies: StepPolicies,
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("is_initial", &self.is_initial)
            .field("is_async", &self.is_async)
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .field("policies", &self.policies)
            .finish()
    }
}

/// A directed edge out of one step (§3 Edge). The four kinds are evaluated
/// in a fixed total order — `Sequential < Branch < Conditional < Error` —
/// ties broken by declaration order (`WorkflowGraph::edges_from`).
#[derive(Clone)]
pub enum Edge {
    /// Taken when the producing step yields `Continue` with a payload
    /// assignable to `to`'s input type.
    Sequential { to: StepId },
    /// Taken when the producing step yields `Branch` whose payload type
    /// matches `payload_type`.
    Branch {
        to: StepId,
        payload_type: TypeDescriptor,
    },
    /// Taken when `predicate(context)` is true; used for boolean
    /// `onTrue`/`onFalse` forks.
    Conditional {
        to: StepId,
        predicate: Arc<dyn Fn(&crate::context::WorkflowContext) -> bool + Send + Sync>,
        label: String,
    },
    /// Taken when the producing step's result is `Fail` and `to`'s input
    /// type accepts an error payload.
    Error { to: StepId },
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Sequential { to } => f.debug_struct("Sequential").field("to", to).finish(),
            Edge::Branch { to, payload_type } => f
                .debug_struct("Branch")
                .field("to", to)
                .field("payload_type", payload_type)
                .finish(),
            Edge::Conditional { to, label, .. } => f
                .debug_struct("Conditional")
                .field("to", to)
                .field("label", label)
                .finish(),
            Edge::Error { to } => f.debug_struct("Error").field("to", to).finish(),
        }
    }
}

impl Edge {
    /// Fixed precedence rank: Sequential < Branch < Conditional < Error.
    pub fn rank(&self) -> u8 {
        match self {
            Edge::Sequential { .. } => 0,
            Edge::Branch { .. } => 1,
            Edge::Conditional { .. } => 2,
            Edge::Error { .. } => 3,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Edge::Sequential { to }
            | Edge::Branch { to, .. }
            | Edge::Conditional { to, .. }
            | Edge::Error { to } => to,
        }
    }
}

/// Metadata for a registered async handler (§3 `asyncHandlers`,
/// §4.2 step 8: "not nodes; stored keyed by declared task-id pattern").
#[derive(Clone)]
pub struct AsyncHandlerSpec {
    /// Non-empty glob over task ids (`*` matches any run of characters).
    pub pattern: String,
    pub handler: StepExecutor,
}

impl fmt::Debug for AsyncHandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandlerSpec")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Immutable, validated workflow definition (§3 WorkflowGraph). Built once
/// per `(id, version)` by either the fluent builder or the step-registration
/// surface, then registered with the engine and never mutated again.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub id: String,
    pub version: String,
    pub input_type: TypeDescriptor,
    pub output_type: TypeDescriptor,
    pub initial_step_id: StepId,
    pub(crate) nodes: HashMap<StepId, Arc<StepNode>>,
    pub(crate) edges: HashMap<StepId, Vec<Edge>>,
    pub(crate) async_handlers: Vec<AsyncHandlerSpec>,
}

impl WorkflowGraph {
    pub fn node(&self, step_id: &str) -> Option<&Arc<StepNode>> {
        self.nodes.get(step_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<StepNode>> {
        self.nodes.values()
    }

    pub fn contains_step(&self, step_id: &str) -> bool {
        self.nodes.contains_key(step_id)
    }

    /// Outgoing edges for `step_id`, already ordered per the fixed
    /// precedence rule (rank, then original declaration order).
    pub fn edges_from(&self, step_id: &str) -> &[Edge] {
        self.edges
            .get(step_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn async_handlers(&self) -> &[AsyncHandlerSpec] {
        &self.async_handlers
    }
}
