//! # workflow-core — a durable, suspendable workflow graph engine
//!
//! `workflow-core` builds an executable [`graph::WorkflowGraph`] from either
//! a declarative step manifest ([`graph::annotation`]) or a fluent builder
//! ([`graph::GraphBuilder`]), then runs it to completion with the
//! [`engine::WorkflowEngine`]: a durable run loop that persists state after
//! every transition, applies per-step retry/circuit-breaker/invocation-limit
//! policies through the [`executor`], and coordinates long-running work
//! through the [`async_coordinator`] so a suspended or crashed process can
//! resume exactly where it left off.
//!
//! ## Core Concepts
//!
//! ### 1. WorkflowGraph — the executable definition
//!
//! A [`graph::WorkflowGraph`] is an immutable value: steps ([`graph::StepNode`])
//! plus directed edges ([`graph::Edge`]) selected at runtime by a step's
//! [`step::StepResult`]. Two surfaces build identical graphs:
//! - [`graph::GraphBuilder`] — an imperative `define().then().then()` DSL.
//! - [`graph::annotation::analyze`] — a declarative manifest
//!   ([`graph::WorkflowDefinition`]) run through the same edge-precedence
//!   algorithm (`nextClasses` > `nextSteps` > `condition` > inferred, plus
//!   always-on Error edges).
//!
//! ### 2. StepResult — the closed return variant
//!
//! Every step returns one of six [`step::StepResult`] variants: `Continue`,
//! `Branch`, `Suspend`, `Async`, `Finish`, `Fail`. The run loop interprets
//! the variant to pick the next edge, persist a suspension, hand work to the
//! async coordinator, or terminate the instance.
//!
//! ### 3. WorkflowEngine — the run loop
//!
//! [`engine::WorkflowEngine`] owns every registered graph, a shared
//! [`circuit_breaker::CircuitBreakerRegistry`], the [`async_coordinator::AsyncCoordinator`],
//! and a bounded worker pool. `execute`/`resume` drive one
//! [`instance::WorkflowInstance`] forward, persisting through the
//! [`persistence`] ports after every transition so a cold-started engine can
//! resume a crashed instance deterministically.
//!
//! ### 4. Async coordination
//!
//! A step that returns `Async` decouples its trigger from its worker: the
//! [`async_coordinator::AsyncCoordinator`] matches the declared `task_id`
//! against glob-registered handlers, runs the matched handler on its own
//! bounded pool, and streams progress back through
//! [`context::ProgressReporter`] into durable [`instance::AsyncStepState`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use workflow_core::{GraphBuilder, PersistencePorts, WorkflowEngine};
//! use workflow_core::config::EngineConfig;
//! use workflow_core::step::{step_fn, StepResult};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> workflow_core::error::Result<()> {
//!     let mut builder = GraphBuilder::define("greet", "1.0.0", "Text", "Text");
//!     builder.then(
//!         Some("shout".into()),
//!         step_fn(|input, _ctx| async move {
//!             let s = input.as_str().unwrap_or_default().to_uppercase();
//!             Ok(StepResult::finish(json!(s)))
//!         }),
//!         "Text",
//!         "Text",
//!     );
//!     let graph = builder.build()?;
//!
//!     let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
//!     engine.register(graph)?;
//!     let execution = engine.execute("greet", json!("hi"), None, None).await?;
//!     let instance = execution.get(std::time::Duration::from_secs(5)).await?;
//!     println!("{:?}", instance.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`schema`] — Type/Schema service: structural schemas, properties-map
//!   round-tripping.
//! - [`graph`] — graph data model plus the fluent and annotation builders.
//! - [`step`] — the closed `StepResult` variant and the step executor type.
//! - [`context`] — per-invocation `WorkflowContext` and `ProgressReporter`.
//! - [`retry`] — exponential-backoff retry policy.
//! - [`circuit_breaker`] — per-step circuit breaker registry.
//! - [`executor`] — single-step invocation: limits, breaker, retry loop.
//! - [`instance`] — durable `WorkflowInstance`/`SuspensionData`/`AsyncStepState`.
//! - [`persistence`] — repository ports plus in-memory reference impls.
//! - [`engine`] — the run loop, `execute`/`resume`, async-completion resumption.
//! - [`async_coordinator`] — task-id pattern matching and the handler pool.
//! - [`event`] — optional fan-out event-publisher port.
//! - [`paging`] — paged list/history request and response shapes.
//! - [`config`] — engine-wide tunables.
//! - [`error`] — the crate's closed error enum.
//! - [`visualization`] — serializable graph summaries for introspection dumps.

pub mod async_coordinator;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod paging;
pub mod persistence;
pub mod retry;
pub mod schema;
pub mod step;
pub mod visualization;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::{AsyncCoordinatorConfig, EngineConfig, PollingConfig};
pub use context::{ProgressReporter, WorkflowContext};
pub use engine::{Execution, WorkflowEngine};
pub use error::{Result, WorkflowError};
pub use event::{EventPublisher, NullEventPublisher};
pub use graph::{
    analyze, AsyncHandlerDescriptor, AsyncHandlerSpec, Edge, GraphBuilder, OnInvocationsLimit,
    RoutingHints, StepDescriptor, StepId, StepNode, StepPolicies, TypeDescriptor,
    WorkflowDefinition, WorkflowGraph,
};
pub use instance::{
    AsyncStepState, ErrorInfo, InstanceStatus, StepExecutionRecord, SuspensionData,
    WorkflowInstance, TRIGGER_DATA_KEY,
};
pub use paging::{Page, PageRequest, SortDirection};
pub use persistence::{
    AsyncStepStateRepository, InMemoryAsyncStepStateRepository,
    InMemorySuspensionDataRepository, InMemoryWorkflowInstanceRepository, PersistencePorts,
    SuspensionDataRepository, WorkflowInstanceRepository,
};
pub use retry::{RetryPolicy, RetryState};
pub use schema::{Schema, SchemaProperty, SchemaService};
pub use step::{step_fn, StepExecutor, StepFailure, StepResult};
pub use visualization::{EdgeSummary, GraphSummary, NodeSummary};
