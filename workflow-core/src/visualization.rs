//! Graph introspection dumps — §4.2 "`getWorkflowGraph`, `visualization`-
//! style dumps". A [`WorkflowGraph`] carries closures (step executors,
//! branch predicates) that are not themselves serializable, so this module
//! projects it down to a plain [`GraphSummary`] DTO — nodes, edges and async
//! handler patterns only — suitable for rendering or shipping to a caller
//! that wants to draw the graph rather than run it.
//!
//! Grounded on `langgraph-core`'s graph-to-`Mermaid`/dict export helpers,
//! generalized here to a YAML dump via `serde_yaml` since this workspace
//! has no templating dependency for a Mermaid-style renderer.

use serde::Serialize;

use crate::graph::{Edge, WorkflowGraph};

#[derive(Debug, Clone, Serialize)]
pub struct EdgeSummary {
    pub kind: &'static str,
    pub to: String,
    pub detail: Option<String>,
}

impl From<&Edge> for EdgeSummary {
    fn from(edge: &Edge) -> Self {
        let to = edge.target().to_string();
        match edge {
            Edge::Sequential { .. } => EdgeSummary {
                kind: "sequential",
                to,
                detail: None,
            },
            Edge::Branch { payload_type, .. } => EdgeSummary {
                kind: "branch",
                to,
                detail: Some(payload_type.clone()),
            },
            Edge::Conditional { label, .. } => EdgeSummary {
                kind: "conditional",
                to,
                detail: Some(label.clone()),
            },
            Edge::Error { .. } => EdgeSummary {
                kind: "error",
                to,
                detail: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: String,
    pub description: Option<String>,
    pub is_initial: bool,
    pub is_async: bool,
    pub input_type: String,
    pub output_type: String,
    pub edges: Vec<EdgeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub id: String,
    pub version: String,
    pub input_type: String,
    pub output_type: String,
    pub initial_step_id: String,
    pub nodes: Vec<NodeSummary>,
    pub async_handler_patterns: Vec<String>,
}

impl GraphSummary {
    pub fn from_graph(graph: &WorkflowGraph) -> Self {
        let mut nodes: Vec<NodeSummary> = graph
            .nodes()
            .map(|node| NodeSummary {
                id: node.id.clone(),
                description: node.description.clone(),
                is_initial: node.is_initial,
                is_async: node.is_async,
                input_type: node.input_type.clone(),
                output_type: node.output_type.clone(),
                edges: graph
                    .edges_from(&node.id)
                    .iter()
                    .map(EdgeSummary::from)
                    .collect(),
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            id: graph.id.clone(),
            version: graph.version.clone(),
            input_type: graph.input_type.clone(),
            output_type: graph.output_type.clone(),
            initial_step_id: graph.initial_step_id.clone(),
            nodes,
            async_handler_patterns: graph
                .async_handlers()
                .iter()
                .map(|h| h.pattern.clone())
                .collect(),
        }
    }

    /// Render as YAML for the `getWorkflowGraph` visualization surface.
    pub fn to_yaml(&self) -> crate::error::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::step::step_fn;
    use serde_json::json;

    #[test]
    fn summarizes_a_linear_graph_and_renders_yaml() {
        let mut builder = GraphBuilder::define("g", "1.0.0", "Text", "Text");
        builder.then(
            Some("only".into()),
            step_fn(|input, _ctx| async move { Ok(crate::step::StepResult::Finish(input)) }),
            "Text",
            "Text",
        );
        let graph = builder.build().unwrap();

        let summary = GraphSummary::from_graph(&graph);
        assert_eq!(summary.nodes.len(), 1);
        assert_eq!(summary.initial_step_id, "only");

        let yaml = summary.to_yaml().unwrap();
        assert!(yaml.contains("only"));
        let _ = json!(null);
    }
}
