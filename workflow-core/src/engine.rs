//! Workflow engine — §4.4, the core run loop.
//!
//! Grounded on `langgraph-core`'s pregel-style superstep runner plus
//! `everruns-everruns`'s durable-execution discipline of persisting state
//! after every transition so a cold-started engine can resume. Edge
//! selection (Sequential/Branch/Conditional/Error, in that fixed order) is
//! driven entirely by `WorkflowGraph::edges_from`, already pre-sorted by
//! `Edge::rank()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tracing::{info, warn};

use crate::async_coordinator::{AsyncCompletion, AsyncCoordinator};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::EngineConfig;
use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::event::EventPublisher;
use crate::executor::{execute_step, ExecutorRuntime};
use crate::graph::{Edge, WorkflowGraph};
use crate::instance::{
    AsyncStepState, ErrorInfo, InstanceStatus, SuspensionData, WorkflowInstance, TRIGGER_DATA_KEY,
};
use crate::persistence::PersistencePorts;
use crate::step::{StepFailure, StepResult};

/// The point the run loop resumes from: a fresh/edge-selected invocation, or
/// a continuation that replays a previously produced `StepResult` (used by
/// `resume` and by async-handler completion) without re-invoking the step.
enum RunFrom {
    Invoke { step_id: String, input: Value },
    Continuation { step_id: String, result: StepResult },
}

/// Handle returned by `execute`/`resume`; resolves once the instance reaches
/// a terminal or partial-terminal state (§4.4: "blocks until a
/// terminal/partial-terminal state").
pub struct Execution {
    receiver: oneshot::Receiver<Result<WorkflowInstance>>,
}

impl Execution {
    pub async fn get(self, timeout: Duration) -> Result<WorkflowInstance> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkflowError::Custom(
                "run loop dropped without producing a result".to_string(),
            )),
            Err(_) => Err(WorkflowError::Custom(
                "timed out waiting for a terminal workflow state".to_string(),
            )),
        }
    }
}

/// Canonical structural fingerprint of a graph used to detect a conflicting
/// re-registration under the same `(id, version)` (§4.4: "duplicate
/// registrations with differing structure fail"). Two graphs with the same
/// node ids/types and the same edges (by target, kind, and declaration
/// order) fingerprint identically regardless of executor closure identity.
fn structural_fingerprint(graph: &WorkflowGraph) -> String {
    let mut node_ids: Vec<&String> = graph.nodes.keys().collect();
    node_ids.sort();
    let mut out = String::new();
    out.push_str(&format!(
        "{}|{}|{}|{}\n",
        graph.id, graph.version, graph.input_type, graph.output_type
    ));
    for id in node_ids {
        let node = &graph.nodes[id];
        out.push_str(&format!(
            "N {} {} {} async={}\n",
            id, node.input_type, node.output_type, node.is_async
        ));
        for edge in graph.edges_from(id) {
            let tag = match edge {
                Edge::Sequential { .. } => "SEQ".to_string(),
                Edge::Branch { payload_type, .. } => format!("BRANCH:{payload_type}"),
                Edge::Conditional { label, .. } => format!("COND:{label}"),
                Edge::Error { .. } => "ERR".to_string(),
            };
            out.push_str(&format!("  E {} -> {}\n", tag, edge.target()));
        }
    }
    out
}

/// Select the outgoing edge for a `Continue`/`Branch` result. Sequential and
/// Branch edges are matched by payload type (§4.4 step 4); a single
/// unambiguous edge of the right kind is taken even without an exact type
/// match, mirroring how the builder's linear chains only ever declare one
/// Sequential edge per step. Falls through to Conditional predicates (in
/// declaration order) when no Sequential/Branch edge matched — the
/// synthetic branch-decision node has only Conditional edges.
fn select_successor(
    graph: &WorkflowGraph,
    from: &str,
    result: &StepResult,
    ctx: &WorkflowContext,
) -> Option<String> {
    let edges = graph.edges_from(from);

    let sequential_target = |produced_type: &str| -> Option<&str> {
        let seq: Vec<&Edge> = edges
            .iter()
            .filter(|e| matches!(e, Edge::Sequential { .. }))
            .collect();
        if seq.len() == 1 {
            return Some(seq[0].target());
        }
        seq.iter()
            .find(|e| {
                graph
                    .node(e.target())
                    .map(|n| n.input_type == produced_type)
                    .unwrap_or(false)
            })
            .map(|e| e.target())
    };

    let branch_target = |produced_type: &str| -> Option<&str> {
        edges
            .iter()
            .find(|e| matches!(e, Edge::Branch { payload_type, .. } if payload_type == produced_type))
            .map(|e| e.target())
    };

    let found = match result {
        StepResult::Continue(_) => {
            let produced_type = graph
                .node(from)
                .map(|n| n.output_type.clone())
                .unwrap_or_default();
            sequential_target(&produced_type).or_else(|| branch_target(&produced_type))
        }
        StepResult::Branch { payload_type, .. } => {
            branch_target(payload_type).or_else(|| sequential_target(payload_type))
        }
        _ => None,
    };
    if let Some(target) = found {
        return Some(target.to_string());
    }

    for edge in edges {
        if let Edge::Conditional { predicate, to, .. } = edge {
            if predicate(ctx) {
                return Some(to.clone());
            }
        }
    }
    None
}

fn first_error_edge(graph: &WorkflowGraph, from: &str) -> Option<String> {
    graph
        .edges_from(from)
        .iter()
        .find_map(|e| matches!(e, Edge::Error { .. }).then(|| e.target().to_string()))
}

/// Reconstruct the `StepResult` an async handler produced, from its
/// persisted terminal `AsyncStepState` (§4.6: "resumes the run loop using
/// the handler's StepResult as if it were the triggering step's result").
fn decode_async_result(state: &AsyncStepState) -> StepResult {
    if let Some(error) = &state.error {
        return StepResult::Fail(StepFailure::new(error.clone()));
    }
    let value = state.result_data.clone().unwrap_or(Value::Null);
    match state.result_kind.as_deref() {
        Some("Continue") => StepResult::Continue(value),
        Some("Branch") => StepResult::Branch {
            payload_type: state.branch_payload_type.clone().unwrap_or_default(),
            value,
        },
        _ => StepResult::Finish(value),
    }
}

struct EngineInner {
    graphs: DashMap<(String, String), Arc<WorkflowGraph>>,
    latest_version: DashMap<String, String>,
    persistence: PersistencePorts,
    executor_runtime: ExecutorRuntime,
    coordinator: Arc<AsyncCoordinator>,
    publishers: Vec<Arc<dyn EventPublisher>>,
    run_loop_semaphore: Arc<Semaphore>,
    run_loop_capacity: u32,
    instance_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    completion_tx: mpsc::UnboundedSender<AsyncCompletion>,
}

impl EngineInner {
    fn instance_lock(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        self.instance_locks
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn graph_for(&self, workflow_id: &str, version: &str) -> Option<Arc<WorkflowGraph>> {
        self.graphs
            .get(&(workflow_id.to_string(), version.to_string()))
            .map(|g| g.clone())
    }

    fn latest_graph(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>> {
        let version = self.latest_version.get(workflow_id)?.clone();
        self.graph_for(workflow_id, &version)
    }

    async fn publish_started(&self, instance_id: &str, workflow_id: &str) {
        for p in &self.publishers {
            p.publish_workflow_started(instance_id, workflow_id).await;
        }
    }

    async fn publish_resumed(&self, instance_id: &str) {
        for p in &self.publishers {
            p.publish_workflow_resumed(instance_id).await;
        }
    }

    async fn publish_suspended(&self, instance_id: &str, message_id: &str) {
        for p in &self.publishers {
            p.publish_workflow_suspended(instance_id, message_id).await;
        }
    }

    async fn publish_completed(&self, instance_id: &str, output: &Value) {
        for p in &self.publishers {
            p.publish_workflow_completed(instance_id, output).await;
        }
    }

    async fn publish_failed(&self, instance_id: &str, error: &str) {
        for p in &self.publishers {
            p.publish_workflow_failed(instance_id, error).await;
        }
    }
}

/// The durable, suspendable workflow engine (§4.4). One `WorkflowEngine`
/// owns every registered graph, the shared circuit-breaker registry, the
/// async coordinator, and the bounded run-loop worker pool.
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(persistence: PersistencePorts, config: EngineConfig) -> Self {
        Self::with_publishers(persistence, config, Vec::new())
    }

    pub fn with_publishers(
        persistence: PersistencePorts,
        config: EngineConfig,
        publishers: Vec<Arc<dyn EventPublisher>>,
    ) -> Self {
        let circuit_breakers = Arc::new(
            CircuitBreakerRegistry::new().with_default(config.default_circuit_breaker.clone()),
        );
        let coordinator = Arc::new(
            AsyncCoordinator::new(crate::config::AsyncCoordinatorConfig::default(), persistence.async_steps.clone())
                .with_publishers(publishers.clone()),
        );
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            graphs: DashMap::new(),
            latest_version: DashMap::new(),
            persistence,
            executor_runtime: ExecutorRuntime::new(circuit_breakers),
            coordinator,
            publishers,
            run_loop_semaphore: Arc::new(Semaphore::new(config.run_loop_workers.max(1))),
            run_loop_capacity: config.run_loop_workers.max(1) as u32,
            instance_locks: DashMap::new(),
            completion_tx,
        });
        spawn_completion_listener(inner.clone(), completion_rx);
        Self { inner }
    }

    /// §4.4: "idempotent by (id, version); duplicate registrations with
    /// differing structure fail".
    pub fn register(&self, graph: WorkflowGraph) -> Result<()> {
        let key = (graph.id.clone(), graph.version.clone());
        let fingerprint = structural_fingerprint(&graph);
        if let Some(existing) = self.inner.graphs.get(&key) {
            if structural_fingerprint(&existing) != fingerprint {
                return Err(WorkflowError::DuplicateRegistration {
                    id: graph.id,
                    version: graph.version,
                });
            }
            return Ok(());
        }
        for node in graph.nodes() {
            if let Some(config) = node.policies.circuit_breaker.clone() {
                self.inner
                    .executor_runtime
                    .circuit_breakers
                    .configure(node.id.clone(), config);
            }
        }
        self.inner
            .latest_version
            .insert(graph.id.clone(), graph.version.clone());
        self.inner.graphs.insert(key, Arc::new(graph));
        Ok(())
    }

    pub fn get_registered_workflows(&self) -> Vec<(String, String)> {
        self.inner
            .graphs
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn get_workflow_graph(
        &self,
        workflow_id: &str,
        version: Option<&str>,
    ) -> Option<Arc<WorkflowGraph>> {
        match version {
            Some(v) => self.inner.graph_for(workflow_id, v),
            None => self.inner.latest_graph(workflow_id),
        }
    }

    pub async fn get_workflow_instance(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        self.inner.persistence.instances.find_by_id(instance_id).await
    }

    pub async fn find_latest_suspended_by_chat_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<WorkflowInstance>> {
        self.inner
            .persistence
            .instances
            .find_latest_suspended_by_chat_id(chat_id)
            .await
    }

    /// §4.4 `execute`.
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: Value,
        instance_id: Option<String>,
        chat_id: Option<String>,
    ) -> Result<Execution> {
        let graph = self
            .inner
            .latest_graph(workflow_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow '{workflow_id}'")))?;
        let instance_id = instance_id.unwrap_or_else(WorkflowInstance::new_id);

        let mut instance = WorkflowInstance::new(
            instance_id.clone(),
            chat_id,
            workflow_id,
            graph.version.clone(),
            graph.initial_step_id.clone(),
        );
        let mut ctx = instance.to_context();
        ctx.set(TRIGGER_DATA_KEY, input.clone());
        instance.absorb_context(&ctx);
        self.inner.persistence.instances.save(instance).await?;
        self.inner.publish_started(&instance_id, workflow_id).await;

        let (tx, rx) = oneshot::channel();
        let start = RunFrom::Invoke {
            step_id: graph.initial_step_id.clone(),
            input,
        };
        spawn_run_loop(self.inner.clone(), graph, instance_id, start, Some(tx));
        Ok(Execution { receiver: rx })
    }

    /// §4.4 `resume`.
    pub async fn resume(&self, instance_id: &str, input: Value) -> Result<Execution> {
        let lock = self.inner.instance_lock(instance_id);
        let (graph, suspended_step_id) = {
            let _guard = lock.lock().await;
            let instance = self
                .inner
                .persistence
                .instances
                .find_by_id(instance_id)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(instance_id.to_string()))?;
            if instance.status != InstanceStatus::Suspended {
                return Err(WorkflowError::invalid_resume(
                    instance_id,
                    "instance is not SUSPENDED",
                ));
            }
            let suspension = self
                .inner
                .persistence
                .suspensions
                .find_by_instance_id(instance_id)
                .await?
                .ok_or_else(|| {
                    WorkflowError::invalid_resume(instance_id, "no suspension data for instance")
                })?;
            self.inner
                .persistence
                .suspensions
                .delete_by_instance_id(instance_id)
                .await?;
            let graph = self
                .inner
                .graph_for(&instance.workflow_id, &instance.workflow_version)
                .ok_or_else(|| WorkflowError::NotFound(instance.workflow_id.clone()))?;
            (graph, suspension.suspended_step_id)
        };

        self.inner.publish_resumed(instance_id).await;
        let (tx, rx) = oneshot::channel();
        let start = RunFrom::Continuation {
            step_id: suspended_step_id,
            result: StepResult::Continue(input),
        };
        spawn_run_loop(
            self.inner.clone(),
            graph,
            instance_id.to_string(),
            start,
            Some(tx),
        );
        Ok(Execution { receiver: rx })
    }

    /// Graceful-drain hook: blocks until every in-flight run-loop task has
    /// released its worker-pool permit. Does not reject new `execute`/
    /// `resume` calls itself — callers stop issuing them first.
    pub async fn shutdown(&self) {
        let _ = self
            .inner
            .run_loop_semaphore
            .acquire_many(self.inner.run_loop_capacity)
            .await;
    }
}

fn spawn_run_loop(
    inner: Arc<EngineInner>,
    graph: Arc<WorkflowGraph>,
    instance_id: String,
    start: RunFrom,
    result_tx: Option<oneshot::Sender<Result<WorkflowInstance>>>,
) {
    tokio::spawn(async move {
        let _permit = inner.run_loop_semaphore.clone().acquire_owned().await;
        run_loop(inner, graph, instance_id, start, result_tx).await;
    });
}

/// Drive one instance forward until it reaches a terminal or
/// partial-terminal (suspended / outstanding-async) state (§4.4 run-loop
/// algorithm, steps 1-5).
async fn run_loop(
    inner: Arc<EngineInner>,
    graph: Arc<WorkflowGraph>,
    instance_id: String,
    start: RunFrom,
    result_tx: Option<oneshot::Sender<Result<WorkflowInstance>>>,
) {
    let lock = inner.instance_lock(&instance_id);
    let _guard = lock.lock().await;

    let mut current = start;
    loop {
        let mut instance = match inner.persistence.instances.find_by_id(&instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                send_result(
                    result_tx,
                    Err(WorkflowError::NotFound(instance_id.clone())),
                );
                return;
            }
            Err(e) => {
                send_result(result_tx, Err(e));
                return;
            }
        };
        if instance.is_terminal() {
            send_result(result_tx, Ok(instance));
            return;
        }
        instance.status = InstanceStatus::Running;
        instance.touch();
        if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
            send_result(result_tx, Err(e));
            return;
        }

        let (step_id, step_result) = match current {
            RunFrom::Invoke { step_id, input } => {
                let node = match graph.node(&step_id) {
                    Some(n) => n.clone(),
                    None => {
                        fail_instance(
                            &inner,
                            &mut instance,
                            &step_id,
                            format!("step '{step_id}' not found in graph"),
                        )
                        .await;
                        send_result(result_tx, Ok(instance));
                        return;
                    }
                };
                let ctx = instance.to_context();
                let execution = execute_step(
                    &inner.executor_runtime,
                    &instance_id,
                    &node,
                    input.clone(),
                    ctx,
                )
                .await;
                instance.execution_history.extend(execution.attempts);
                match execution.result {
                    Ok(result) => (step_id, result),
                    Err(e) => {
                        if let Some(target) = first_error_edge(&graph, &step_id) {
                            let payload = serde_json::json!({
                                "message": e.to_string(),
                                "stepId": step_id,
                            });
                            instance.current_step_id = Some(target.clone());
                            instance.touch();
                            if let Err(save_err) =
                                inner.persistence.instances.save(instance.clone()).await
                            {
                                send_result(result_tx, Err(save_err));
                                return;
                            }
                            current = RunFrom::Invoke {
                                step_id: target,
                                input: payload,
                            };
                            continue;
                        }
                        fail_instance(&inner, &mut instance, &step_id, e.to_string()).await;
                        send_result(result_tx, Ok(instance));
                        return;
                    }
                }
            }
            RunFrom::Continuation { step_id, result } => (step_id, result),
        };

        match step_result {
            StepResult::Continue(value) => {
                let mut ctx = instance.to_context();
                ctx.record_step_output(&step_id, value.clone());
                instance.absorb_context(&ctx);
                match select_successor(&graph, &step_id, &StepResult::Continue(value.clone()), &ctx)
                {
                    Some(next_id) => {
                        instance.current_step_id = Some(next_id.clone());
                        instance.touch();
                        if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                            send_result(result_tx, Err(e));
                            return;
                        }
                        current = RunFrom::Invoke {
                            step_id: next_id,
                            input: value,
                        };
                    }
                    None => {
                        let output_type = graph
                            .node(&step_id)
                            .map(|n| n.output_type.clone())
                            .unwrap_or_default();
                        fail_instance(
                            &inner,
                            &mut instance,
                            &step_id,
                            WorkflowError::no_successor(&step_id, output_type).to_string(),
                        )
                        .await;
                        send_result(result_tx, Ok(instance));
                        return;
                    }
                }
            }
            StepResult::Branch { payload_type, value } => {
                let mut ctx = instance.to_context();
                ctx.record_step_output(&step_id, value.clone());
                instance.absorb_context(&ctx);
                let branch_result = StepResult::Branch {
                    payload_type: payload_type.clone(),
                    value: value.clone(),
                };
                match select_successor(&graph, &step_id, &branch_result, &ctx) {
                    Some(next_id) => {
                        instance.current_step_id = Some(next_id.clone());
                        instance.touch();
                        if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                            send_result(result_tx, Err(e));
                            return;
                        }
                        current = RunFrom::Invoke {
                            step_id: next_id,
                            input: value,
                        };
                    }
                    None => {
                        fail_instance(
                            &inner,
                            &mut instance,
                            &step_id,
                            WorkflowError::no_successor(&step_id, payload_type).to_string(),
                        )
                        .await;
                        send_result(result_tx, Ok(instance));
                        return;
                    }
                }
            }
            StepResult::Suspend {
                prompt_to_user,
                next_input_type,
                message_id,
            } => {
                let message_id = if message_id.is_empty() {
                    WorkflowInstance::new_id()
                } else {
                    message_id
                };
                let suspension = SuspensionData::new(
                    instance_id.clone(),
                    message_id.clone(),
                    prompt_to_user,
                    next_input_type,
                    step_id.clone(),
                );
                if let Err(e) = inner.persistence.suspensions.save(suspension).await {
                    send_result(result_tx, Err(e));
                    return;
                }
                instance.status = InstanceStatus::Suspended;
                instance.current_step_id = Some(step_id);
                instance.touch();
                if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                    send_result(result_tx, Err(e));
                    return;
                }
                inner
                    .publish_suspended(&instance_id, &message_id)
                    .await;
                send_result(result_tx, Ok(instance));
                return;
            }
            StepResult::Async {
                task_id,
                timeout_ms,
                task_args,
                immediate_data,
            } => {
                let message_id = WorkflowInstance::new_id();
                let async_state = AsyncStepState::new(
                    message_id,
                    instance_id.clone(),
                    step_id.clone(),
                    task_id,
                    task_args,
                    immediate_data,
                );
                if let Err(e) = inner.persistence.async_steps.save(async_state.clone()).await {
                    send_result(result_tx, Err(e));
                    return;
                }
                instance.current_step_id = Some(step_id.clone());
                instance.touch();
                if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                    send_result(result_tx, Err(e));
                    return;
                }
                let ctx = instance.to_context();
                let dispatch_result = inner
                    .coordinator
                    .dispatch(
                        graph.async_handlers(),
                        async_state,
                        timeout_ms,
                        ctx,
                        inner.completion_tx.clone(),
                    )
                    .await;
                if let Err(e) = dispatch_result {
                    fail_instance(&inner, &mut instance, &step_id, e.to_string()).await;
                }
                send_result(result_tx, Ok(instance));
                return;
            }
            StepResult::Finish(value) => {
                let mut ctx = instance.to_context();
                ctx.record_step_output(&step_id, value.clone());
                instance.absorb_context(&ctx);
                instance.status = InstanceStatus::Completed;
                instance.touch();
                if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                    send_result(result_tx, Err(e));
                    return;
                }
                inner.publish_completed(&instance_id, &value).await;
                send_result(result_tx, Ok(instance));
                return;
            }
            StepResult::Fail(failure) => {
                if let Some(target) = first_error_edge(&graph, &step_id) {
                    let payload = serde_json::json!({
                        "message": failure.message,
                        "kind": failure.kind,
                        "stepId": step_id,
                    });
                    instance.current_step_id = Some(target.clone());
                    instance.touch();
                    if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
                        send_result(result_tx, Err(e));
                        return;
                    }
                    current = RunFrom::Invoke {
                        step_id: target,
                        input: payload,
                    };
                } else {
                    fail_instance(&inner, &mut instance, &step_id, failure.message).await;
                    send_result(result_tx, Ok(instance));
                    return;
                }
            }
        }
    }
}

async fn fail_instance(
    inner: &Arc<EngineInner>,
    instance: &mut WorkflowInstance,
    step_id: &str,
    message: String,
) {
    instance.status = InstanceStatus::Failed;
    instance.error_info = Some(ErrorInfo {
        message: message.clone(),
        step_id: Some(step_id.to_string()),
        occurred_at: chrono::Utc::now(),
    });
    instance.touch();
    if let Err(e) = inner.persistence.instances.save(instance.clone()).await {
        warn!(error = %e, instance_id = %instance.instance_id, "failed to persist FAILED instance");
    }
    inner.publish_failed(&instance.instance_id, &message).await;
}

fn send_result(
    tx: Option<oneshot::Sender<Result<WorkflowInstance>>>,
    result: Result<WorkflowInstance>,
) {
    if let Some(tx) = tx {
        let _ = tx.send(result);
    }
}

/// Consumes [`AsyncCompletion`] notifications and resumes the owning
/// instance's run loop from the completed async step, using its persisted
/// terminal result as if it were the triggering step's `StepResult` (§4.6).
fn spawn_completion_listener(
    inner: Arc<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<AsyncCompletion>,
) {
    tokio::spawn(async move {
        while let Some(completion) = rx.recv().await {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(e) = resume_from_async_completion(&inner, &completion).await {
                    warn!(
                        error = %e,
                        instance_id = %completion.instance_id,
                        "failed to resume instance after async completion"
                    );
                }
            });
        }
        info!("async completion listener shut down");
    });
}

async fn resume_from_async_completion(
    inner: &Arc<EngineInner>,
    completion: &AsyncCompletion,
) -> Result<()> {
    let state = inner
        .persistence
        .async_steps
        .find_by_message_id(&completion.message_id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(completion.message_id.clone()))?;
    let instance = inner
        .persistence
        .instances
        .find_by_id(&completion.instance_id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(completion.instance_id.clone()))?;
    let graph = inner
        .graph_for(&instance.workflow_id, &instance.workflow_version)
        .ok_or_else(|| WorkflowError::NotFound(instance.workflow_id.clone()))?;

    let result = decode_async_result(&state);
    let start = RunFrom::Continuation {
        step_id: state.step_id,
        result,
    };
    spawn_run_loop(inner.clone(), graph, completion.instance_id.clone(), start, None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::graph::GraphBuilder;
    use crate::step::step_fn;
    use serde_json::json;

    fn upper_graph() -> WorkflowGraph {
        let mut builder = GraphBuilder::define("upper", "1.0.0", "Text", "Text");
        builder.then(
            Some("shout".into()),
            step_fn(|input, _ctx| async move {
                let s = input.as_str().unwrap_or_default().to_uppercase();
                Ok(StepResult::finish(json!(s)))
            }),
            "Text",
            "Text",
        );
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn executes_a_single_step_workflow_to_completion() {
        let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
        engine.register(upper_graph()).unwrap();
        let execution = engine
            .execute("upper", json!("hi"), None, None)
            .await
            .unwrap();
        let instance = execution.get(Duration::from_secs(5)).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(
            instance.step_outputs.get("shout").cloned(),
            Some(json!("HI"))
        );
    }

    #[tokio::test]
    async fn register_rejects_conflicting_redefinition() {
        let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
        engine.register(upper_graph()).unwrap();
        let mut builder = GraphBuilder::define("upper", "1.0.0", "Text", "Text");
        builder.then(
            Some("different".into()),
            step_fn(|input, _ctx| async move { Ok(StepResult::finish(input)) }),
            "Text",
            "Text",
        );
        let conflicting = builder.build().unwrap();
        assert!(matches!(
            engine.register(conflicting),
            Err(WorkflowError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn suspend_then_resume_reaches_completion() {
        let mut builder = GraphBuilder::define("ask", "1.0.0", "Input", "Output");
        builder.then(
            Some("ask_name".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({"question": "name?"}),
                    next_input_type: "Name".to_string(),
                    message_id: String::new(),
                })
            }),
            "Input",
            "Name",
        );
        builder.then(
            Some("greet".into()),
            step_fn(|input, _ctx| async move {
                Ok(StepResult::finish(json!(format!(
                    "hello {}",
                    input["name"].as_str().unwrap_or_default()
                ))))
            }),
            "Name",
            "Output",
        );
        let graph = builder.build().unwrap();

        let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
        engine.register(graph).unwrap();
        let execution = engine
            .execute("ask", json!({}), Some("i1".into()), Some("chat1".into()))
            .await
            .unwrap();
        let suspended = execution.get(Duration::from_secs(5)).await.unwrap();
        assert_eq!(suspended.status, InstanceStatus::Suspended);

        let resumption = engine
            .resume("i1", json!({"name": "Ada"}))
            .await
            .unwrap();
        let completed = resumption.get(Duration::from_secs(5)).await.unwrap();
        assert_eq!(completed.status, InstanceStatus::Completed);
        assert_eq!(
            completed.step_outputs.get("greet").cloned(),
            Some(json!("hello Ada"))
        );
    }

    #[tokio::test]
    async fn async_step_resumes_via_completion_listener() {
        let mut builder = GraphBuilder::define("job", "1.0.0", "Input", "Output");
        builder.then(
            Some("kickoff".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Async {
                    task_id: "processAsync".to_string(),
                    timeout_ms: 0,
                    task_args: json!({}),
                    immediate_data: json!({}),
                })
            }),
            "Input",
            "Output",
        );
        builder.with_async_handler(
            "processAsync",
            step_fn(|_input, _ctx| async move { Ok(StepResult::finish(json!("done"))) }),
        );
        let graph = builder.build().unwrap();

        let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
        engine.register(graph).unwrap();
        let execution = engine
            .execute("job", json!({}), Some("i1".into()), None)
            .await
            .unwrap();
        let partial = execution.get(Duration::from_secs(5)).await.unwrap();
        assert_eq!(partial.status, InstanceStatus::Running);

        // Poll until the background completion listener has resumed the
        // instance to its terminal state.
        for _ in 0..50 {
            let current = engine.get_workflow_instance("i1").await.unwrap().unwrap();
            if current.status == InstanceStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("instance never completed after async handler resumed it");
    }

    #[tokio::test]
    async fn no_successor_fails_the_instance() {
        let mut builder = GraphBuilder::define("dead_end", "1.0.0", "Input", "Output");
        builder.then(
            Some("go".into()),
            step_fn(|input, _ctx| async move { Ok(StepResult::Continue(input)) }),
            "Input",
            "Output",
        );
        let graph = builder.build().unwrap();
        let engine = WorkflowEngine::new(PersistencePorts::in_memory(), EngineConfig::default());
        engine.register(graph).unwrap();
        let execution = engine.execute("dead_end", json!({}), None, None).await.unwrap();
        let instance = execution.get(Duration::from_secs(5)).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.error_info.is_some());
    }
}
