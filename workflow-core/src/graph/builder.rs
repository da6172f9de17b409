//! Fluent graph builder — §4.3.
//!
//! Grounded on `langgraph-core::builder::StateGraph`'s `add_node`/
//! `add_edge`/`compile` shape: chainable `&mut self -> &mut Self` methods
//! that mutate an in-progress graph, finished by a consuming `build()` that
//! validates and freezes it. Generalized to the spec's four edge kinds and
//! to attach per-step policies to "the most recently declared step", the
//! way `with_retry_policy`/`with_timeout` read in spec.md §4.3.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::retry::RetryPolicy;
use crate::step::StepExecutor;

use super::model::{
    AsyncHandlerSpec, Edge, OnInvocationsLimit, StepNode, StepPolicies, TypeDescriptor,
    WorkflowGraph,
};

/// Imperative builder DSL producing the same `WorkflowGraph` shape the
/// step-registration surface (`crate::graph::annotation`) does.
pub struct GraphBuilder {
    id: String,
    version: String,
    input_type: TypeDescriptor,
    output_type: TypeDescriptor,
    nodes: HashMap<String, StepNode>,
    declaration_order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
    async_handlers: Vec<AsyncHandlerSpec>,
    initial_step_id: Option<String>,
    last_step_id: Option<String>,
    auto_id_counter: u32,
}

impl GraphBuilder {
    /// Start a builder for `(id, version)` with the given overall input and
    /// output type descriptors.
    pub fn define(
        id: impl Into<String>,
        version: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
            nodes: HashMap::new(),
            declaration_order: Vec::new(),
            edges: HashMap::new(),
            async_handlers: Vec::new(),
            initial_step_id: None,
            last_step_id: None,
            auto_id_counter: 0,
        }
    }

    fn next_auto_id(&mut self) -> String {
        self.auto_id_counter += 1;
        format!("step{}", self.auto_id_counter)
    }

    fn insert_node(&mut self, node: StepNode) {
        let id = node.id.clone();
        if self.initial_step_id.is_none() {
            self.initial_step_id = Some(id.clone());
        }
        if let Some(prev) = self.last_step_id.take() {
            self.edges
                .entry(prev)
                .or_default()
                .push(Edge::Sequential { to: id.clone() });
        }
        self.declaration_order.push(id.clone());
        self.nodes.insert(id.clone(), node);
        self.last_step_id = Some(id);
    }

    /// Append a sequential step after the most recently declared one (or as
    /// the initial step, if this is the first).
    pub fn then(
        &mut self,
        id: Option<String>,
        executor: StepExecutor,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> &mut Self {
        let id = id.unwrap_or_else(|| self.next_auto_id());
        self.insert_node(StepNode {
            id,
            description: None,
            is_initial: false,
            is_async: false,
            input_type: input_type.into(),
            output_type: output_type.into(),
            executor,
            policies: StepPolicies::default(),
        });
        self
    }

    /// Create a synthetic decision node that conditionally forks to one of
    /// two sub-builders, joined back by `Conditional` edges (§4.3
    /// `branch`). The returned builders for the true/false arms are merged
    /// into `self`; the decision node becomes the new "most recently
    /// declared step" reference point for attaching policies, while the
    /// last step of whichever arm is taken becomes the resumption point for
    /// subsequent `then` calls on the *true* arm's tail (the false arm's
    /// tail is left dangling for the caller to join explicitly via
    /// `then`/`with_async_handler` as needed, mirroring that the analyzer
    /// surface does not auto-join branches either — §4.2 step 7c produces
    /// two independent Conditional edges, not a merge).
    pub fn branch<FT, FF>(
        &mut self,
        decision_id: Option<String>,
        predicate: Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>,
        build_true: FT,
        build_false: FF,
    ) -> &mut Self
    where
        FT: FnOnce(&mut GraphBuilder),
        FF: FnOnce(&mut GraphBuilder),
    {
        let decision_id = decision_id.unwrap_or_else(|| self.next_auto_id());
        // A decision node is a pass-through step: it exists purely to anchor
        // the two conditional edges.
        let passthrough: StepExecutor = crate::step::step_fn(|input, _ctx| async move {
            Ok(crate::step::StepResult::Continue(input))
        });
        self.insert_node(StepNode {
            id: decision_id.clone(),
            description: Some("branch decision".to_string()),
            is_initial: false,
            is_async: false,
            input_type: self.input_type.clone(),
            output_type: self.input_type.clone(),
            executor: passthrough,
            policies: StepPolicies::default(),
        });
        // insert_node already consumed `last_step_id` into a Sequential edge
        // into the decision node; now branch out of it conditionally.
        self.last_step_id = None;

        let mut true_builder = GraphBuilder::define(
            self.id.clone(),
            self.version.clone(),
            self.input_type.clone(),
            self.output_type.clone(),
        );
        build_true(&mut true_builder);
        let true_entry = true_builder.initial_step_id.clone();
        self.merge_subgraph(true_builder);

        let mut false_builder = GraphBuilder::define(
            self.id.clone(),
            self.version.clone(),
            self.input_type.clone(),
            self.output_type.clone(),
        );
        build_false(&mut false_builder);
        let false_entry = false_builder.initial_step_id.clone();
        self.merge_subgraph(false_builder);

        if let Some(to) = true_entry {
            self.edges.entry(decision_id.clone()).or_default().push(
                Edge::Conditional {
                    to,
                    predicate: predicate.clone(),
                    label: "onTrue".to_string(),
                },
            );
        }
        if let Some(to) = false_entry {
            self.edges.entry(decision_id).or_default().push(Edge::Conditional {
                to,
                predicate: Arc::new(move |ctx| !predicate(ctx)),
                label: "onFalse".to_string(),
            });
        }
        self
    }

    fn merge_subgraph(&mut self, other: GraphBuilder) {
        for id in other.declaration_order {
            if let Some(node) = other.nodes.get(&id) {
                self.declaration_order.push(id.clone());
                self.nodes.insert(id.clone(), node.clone());
            }
        }
        for (from, edges) in other.edges {
            self.edges.entry(from).or_default().extend(edges);
        }
        for handler in other.async_handlers {
            self.async_handlers.push(handler);
        }
    }

    /// Register an async handler under a glob `pattern` over task ids
    /// (§4.2 step 8: handlers are not nodes).
    pub fn with_async_handler(&mut self, pattern: impl Into<String>, handler: StepExecutor) -> &mut Self {
        self.async_handlers.push(AsyncHandlerSpec {
            pattern: pattern.into(),
            handler,
        });
        self
    }

    fn last_node_mut(&mut self) -> Option<&mut StepNode> {
        let id = self.last_step_id.clone()?;
        self.nodes.get_mut(&id)
    }

    pub fn with_retry_policy(&mut self, policy: RetryPolicy) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.policies.retry = Some(policy);
        }
        self
    }

    pub fn with_invocation_limit(&mut self, limit: u32) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.policies.invocation_limit = Some(limit);
        }
        self
    }

    pub fn with_invocation_control(&mut self, limit: u32, on_limit: OnInvocationsLimit) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.policies.invocation_limit = Some(limit);
            node.policies.on_invocations_limit = Some(on_limit);
        }
        self
    }

    pub fn with_timeout(&mut self, timeout_ms: u64) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.policies.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Override the circuit breaker thresholds for the most recently
    /// declared step (§8 scenario 5). Applied to the engine's registry at
    /// `register()` time.
    pub fn with_circuit_breaker_config(
        &mut self,
        config: crate::circuit_breaker::CircuitBreakerConfig,
    ) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.policies.circuit_breaker = Some(config);
        }
        self
    }

    pub fn with_description(&mut self, description: impl Into<String>) -> &mut Self {
        if let Some(node) = self.last_node_mut() {
            node.description = Some(description.into());
        }
        self
    }

    /// Validate and freeze the graph (§4.3: "non-empty, unique ids, an
    /// initial step present, initial step exists in nodes").
    pub fn build(self) -> Result<WorkflowGraph> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::GraphValidation(
                "graph has no steps".to_string(),
            ));
        }
        // `insert_node` writes through a `HashMap`, so a second `then`/
        // `branch` declaration under the same id silently clobbers the
        // first node and strands its edge; `declaration_order` still
        // records both pushes, so it is the only place left to catch the
        // collision (§4.3, §7 `GraphValidation`).
        let mut seen_ids = std::collections::HashSet::with_capacity(self.declaration_order.len());
        for id in &self.declaration_order {
            if !seen_ids.insert(id.as_str()) {
                return Err(WorkflowError::GraphValidation(format!(
                    "duplicate step id '{id}'"
                )));
            }
        }
        let initial_step_id = self.initial_step_id.ok_or_else(|| {
            WorkflowError::GraphValidation("no initial step declared".to_string())
        })?;
        if !self.nodes.contains_key(&initial_step_id) {
            return Err(WorkflowError::GraphValidation(format!(
                "initial step '{initial_step_id}' not present in nodes"
            )));
        }
        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(WorkflowError::GraphValidation(format!(
                    "edge source '{from}' does not exist"
                )));
            }
            for edge in edges {
                if !self.nodes.contains_key(edge.target()) {
                    return Err(WorkflowError::GraphValidation(format!(
                        "edge target '{}' does not exist",
                        edge.target()
                    )));
                }
            }
        }

        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (id, mut node) in self.nodes {
            node.is_initial = id == initial_step_id;
            nodes.insert(id, Arc::new(node));
        }

        let mut edges = self.edges;
        for edge_list in edges.values_mut() {
            edge_list.sort_by_key(|e| e.rank());
        }

        Ok(WorkflowGraph {
            id: self.id,
            version: self.version,
            input_type: self.input_type,
            output_type: self.output_type,
            initial_step_id,
            nodes,
            edges,
            async_handlers: self.async_handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_executor() -> StepExecutor {
        crate::step::step_fn(|input, _ctx| async move {
            Ok(crate::step::StepResult::Continue(input))
        })
    }

    #[test]
    fn linear_chain_links_sequential_edges() {
        let mut builder = GraphBuilder::define("wf", "1.0.0", "Input", "Output");
        builder
            .then(Some("a".into()), noop_executor(), "Input", "Mid")
            .then(Some("b".into()), noop_executor(), "Mid", "Output");
        let graph = builder.build().unwrap();
        assert_eq!(graph.initial_step_id, "a");
        let edges = graph.edges_from("a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target(), "b");
    }

    #[test]
    fn build_rejects_missing_initial_step() {
        let builder = GraphBuilder::define("wf", "1.0.0", "Input", "Output");
        assert!(builder.build().is_err());
    }

    #[test]
    fn build_rejects_duplicate_step_ids() {
        let mut builder = GraphBuilder::define("wf", "1.0.0", "Input", "Output");
        builder
            .then(Some("a".into()), noop_executor(), "Input", "Mid")
            .then(Some("a".into()), noop_executor(), "Mid", "Output");
        assert!(matches!(
            builder.build(),
            Err(WorkflowError::GraphValidation(_))
        ));
    }

    #[test]
    fn branch_creates_two_conditional_edges() {
        let mut builder = GraphBuilder::define("wf", "1.0.0", "Input", "Output");
        builder.then(Some("start".into()), noop_executor(), "Input", "Bool");
        builder.branch(
            Some("decide".into()),
            Arc::new(|ctx| ctx.get("flag").and_then(|v| v.as_bool()).unwrap_or(false)),
            |b| {
                b.then(Some("yes".into()), noop_executor(), "Bool", "Output");
            },
            |b| {
                b.then(Some("no".into()), noop_executor(), "Bool", "Output");
            },
        );
        let graph = builder.build().unwrap();
        let edges = graph.edges_from("decide");
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| matches!(e, Edge::Conditional { .. })));
        let _ = json!({});
    }

    #[test]
    fn policies_attach_to_most_recently_declared_step() {
        let mut builder = GraphBuilder::define("wf", "1.0.0", "Input", "Output");
        builder
            .then(Some("a".into()), noop_executor(), "Input", "Output")
            .with_timeout(5_000)
            .with_invocation_limit(3);
        let graph = builder.build().unwrap();
        let node = graph.node("a").unwrap();
        assert_eq!(node.policies.timeout_ms, Some(5_000));
        assert_eq!(node.policies.invocation_limit, Some(3));
    }
}
