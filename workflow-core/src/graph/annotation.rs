//! Step-registration surface — §4.2 "Graph Builder — Annotation Analyzer".
//!
//! spec.md's analyzer scans a tagged class's methods via JVM-style runtime
//! reflection. Rust has no equivalent runtime reflection, so per the
//! REDESIGN FLAG in spec.md §9 ("a faithful re-implementation may instead
//! require an explicit registration call per step... both surfaces must
//! produce the identical `WorkflowGraph` contract"), this module replaces
//! the reflective scan with an explicit, compile-time manifest: a
//! [`WorkflowDefinition`] implementor declares its steps and async handlers
//! up front, and [`analyze`] runs exactly spec.md §4.2 steps 4-9 (edge
//! precedence, Error-edge injection, reachability warning) over that
//! manifest instead of over reflected methods.
//!
//! Grounded on the "registry of descriptors" shape in `orchestrator`'s
//! repository/registration modules, generalized to typed step descriptors
//! (`langgraph-core` itself has no annotation surface — its only
//! construction path is the fluent `StateGraph` builder, which this crate's
//! [`super::builder::GraphBuilder`] plays the equivalent role for).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};

use super::model::{
    AsyncHandlerSpec, Edge, StepId, StepNode, StepPolicies, TypeDescriptor, WorkflowGraph,
};

/// Conventional input-type descriptor marking a step as an error handler
/// (the structural stand-in for "input type is a supertype of
/// `Throwable`", §4.2 step 7's always-on Error-edge rule).
pub const ERROR_TYPE: &str = "Error";

/// How a step declares its outgoing routing, evaluated in the precedence
/// order spec.md §4.2 step 7 names, stopping at the first populated rule.
#[derive(Clone, Default)]
pub struct RoutingHints {
    /// (a) One Sequential edge per step whose input type is assignable
    /// from one of these declared classes.
    pub next_classes: Vec<TypeDescriptor>,
    /// (b) One Sequential edge per explicitly named target step id.
    pub next_steps: Vec<StepId>,
    /// (c) `condition` + `on_true`/`on_false`: two symmetric Conditional
    /// edges.
    pub condition: Option<Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>>,
    pub on_true: Option<StepId>,
    pub on_false: Option<StepId>,
    /// (d) Inferred from the step's declared result shape, used only when
    /// (a)-(c) are all absent.
    pub inferred_continue: Option<StepId>,
    pub inferred_branches: Vec<(TypeDescriptor, StepId)>,
}

/// One step's manifest entry — the declarative equivalent of a reflected,
/// `@Step`-tagged method (§4.2 steps 1-6).
pub struct StepDescriptor {
    pub id: StepId,
    pub description: Option<String>,
    pub is_initial: bool,
    pub input_type: TypeDescriptor,
    pub output_type: TypeDescriptor,
    pub executor: crate::step::StepExecutor,
    pub policies: StepPolicies,
    pub routing: RoutingHints,
}

/// One async handler's manifest entry (§4.2 step 8: "not nodes").
pub struct AsyncHandlerDescriptor {
    pub task_id_pattern: String,
    pub handler: crate::step::StepExecutor,
}

/// A workflow author implements this trait once to declare the complete
/// step/async-handler manifest that [`analyze`] turns into a
/// [`WorkflowGraph`] — the Rust equivalent of tagging a class and letting
/// the analyzer reflect over it.
pub trait WorkflowDefinition: Send + Sync {
    fn id(&self) -> String;
    fn version(&self) -> String;
    fn input_type(&self) -> TypeDescriptor;
    fn output_type(&self) -> TypeDescriptor;
    fn steps(&self) -> Vec<StepDescriptor>;
    fn async_handlers(&self) -> Vec<AsyncHandlerDescriptor> {
        Vec::new()
    }
}

/// Run the §4.2 steps 4-9 validation and edge-construction algorithm over
/// `definition`'s declared manifest.
pub fn analyze(definition: &dyn WorkflowDefinition) -> Result<WorkflowGraph> {
    let steps = definition.steps();

    // Step 4: exactly one initial step.
    let initial_candidates: Vec<&StepDescriptor> = steps.iter().filter(|s| s.is_initial).collect();
    if initial_candidates.is_empty() {
        return Err(WorkflowError::GraphValidation(
            "no step marked as initial".to_string(),
        ));
    }
    if initial_candidates.len() > 1 {
        return Err(WorkflowError::GraphValidation(format!(
            "multiple steps marked as initial: {}",
            initial_candidates
                .iter()
                .map(|s| s.id.clone())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }
    let initial_step_id = initial_candidates[0].id.clone();

    // Step 5 (signature validation, simplified to structural descriptors):
    // every step must declare non-empty input/output type descriptors.
    let mut seen_ids = HashSet::new();
    for step in &steps {
        if step.id.is_empty() {
            return Err(WorkflowError::GraphValidation(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen_ids.insert(step.id.clone()) {
            return Err(WorkflowError::GraphValidation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
        if step.input_type.is_empty() || step.output_type.is_empty() {
            return Err(WorkflowError::GraphValidation(format!(
                "step '{}' must declare non-empty input/output types",
                step.id
            )));
        }
    }

    let by_input_type: HashMap<&str, Vec<&StepDescriptor>> = {
        let mut map: HashMap<&str, Vec<&StepDescriptor>> = HashMap::new();
        for step in &steps {
            map.entry(step.input_type.as_str()).or_default().push(step);
        }
        map
    };

    let mut edges: HashMap<StepId, Vec<Edge>> = HashMap::new();

    // Steps 6-7: precedence-ordered edge construction per step.
    for step in &steps {
        let mut produced = false;

        if !step.routing.next_classes.is_empty() {
            for class in &step.routing.next_classes {
                if let Some(targets) = by_input_type.get(class.as_str()) {
                    for target in targets {
                        edges.entry(step.id.clone()).or_default().push(Edge::Sequential {
                            to: target.id.clone(),
                        });
                        produced = true;
                    }
                }
            }
        }

        if !produced && !step.routing.next_steps.is_empty() {
            for target_id in &step.routing.next_steps {
                if seen_ids.contains(target_id) {
                    edges.entry(step.id.clone()).or_default().push(Edge::Sequential {
                        to: target_id.clone(),
                    });
                    produced = true;
                }
                // Unknown targets: dropped with a (silent, non-fatal)
                // warning per §4.2 step 7b.
            }
        }

        if !produced {
            if let (Some(predicate), Some(on_true), Some(on_false)) = (
                step.routing.condition.clone(),
                step.routing.on_true.clone(),
                step.routing.on_false.clone(),
            ) {
                edges.entry(step.id.clone()).or_default().push(Edge::Conditional {
                    to: on_true,
                    predicate: predicate.clone(),
                    label: "onTrue".to_string(),
                });
                edges.entry(step.id.clone()).or_default().push(Edge::Conditional {
                    to: on_false,
                    predicate: Arc::new(move |ctx| !predicate(ctx)),
                    label: "onFalse".to_string(),
                });
                produced = true;
            }
        }

        if !produced {
            if let Some(to) = &step.routing.inferred_continue {
                edges
                    .entry(step.id.clone())
                    .or_default()
                    .push(Edge::Sequential { to: to.clone() });
            }
            for (payload_type, to) in &step.routing.inferred_branches {
                edges.entry(step.id.clone()).or_default().push(Edge::Branch {
                    to: to.clone(),
                    payload_type: payload_type.clone(),
                });
            }
        }
    }

    // Step 7 (always-on rule): Error edges from every step to every step
    // whose input type accepts an error payload.
    let error_handlers: Vec<&StepDescriptor> = steps
        .iter()
        .filter(|s| s.input_type == ERROR_TYPE)
        .collect();
    for step in &steps {
        for handler in &error_handlers {
            if handler.id == step.id {
                continue;
            }
            edges
                .entry(step.id.clone())
                .or_default()
                .push(Edge::Error { to: handler.id.clone() });
        }
    }

    for edge_list in edges.values_mut() {
        edge_list.sort_by_key(|e| e.rank());
    }

    let mut nodes = HashMap::with_capacity(steps.len());
    for step in steps {
        nodes.insert(
            step.id.clone(),
            Arc::new(StepNode {
                id: step.id.clone(),
                description: step.description,
                is_initial: step.id == initial_step_id,
                is_async: false,
                input_type: step.input_type,
                output_type: step.output_type,
                executor: step.executor,
                policies: step.policies,
            }),
        );
    }

    // Step 9: reachability is a warning, not a fatal error.
    for unreachable in unreachable_steps(&initial_step_id, &nodes, &edges) {
        tracing::warn!(step_id = %unreachable, "step unreachable from initial step");
    }

    let async_handlers = definition
        .async_handlers()
        .into_iter()
        .map(|d| {
            if d.task_id_pattern.is_empty() {
                return Err(WorkflowError::GraphValidation(
                    "async handler task-id pattern must be non-empty".to_string(),
                ));
            }
            Ok(AsyncHandlerSpec {
                pattern: d.task_id_pattern,
                handler: d.handler,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(WorkflowGraph {
        id: definition.id(),
        version: definition.version(),
        input_type: definition.input_type(),
        output_type: definition.output_type(),
        initial_step_id,
        nodes,
        edges,
        async_handlers,
    })
}

fn unreachable_steps(
    initial_step_id: &str,
    nodes: &HashMap<StepId, Arc<StepNode>>,
    edges: &HashMap<StepId, Vec<Edge>>,
) -> Vec<StepId> {
    let mut visited: HashSet<StepId> = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(initial_step_id.to_string());
    visited.insert(initial_step_id.to_string());
    while let Some(current) = queue.pop_front() {
        if let Some(out) = edges.get(&current) {
            for edge in out {
                let target = edge.target().to_string();
                if visited.insert(target.clone()) {
                    queue.push_back(target);
                }
            }
        }
    }
    nodes
        .keys()
        .filter(|id| !visited.contains(*id))
        .cloned()
        .collect()
}
