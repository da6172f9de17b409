//! Graph construction — §3 data model plus the two interchangeable builder
//! surfaces of §4.2/§4.3 ("a fluent-built graph is interchangeable with an
//! analyzer-built graph; the engine must not distinguish them").

pub mod annotation;
pub mod builder;
pub mod model;

pub use annotation::{analyze, AsyncHandlerDescriptor, RoutingHints, StepDescriptor, WorkflowDefinition};
pub use builder::GraphBuilder;
pub use model::{
    AsyncHandlerSpec, Edge, OnInvocationsLimit, StepId, StepNode, StepPolicies, TypeDescriptor,
    WorkflowGraph,
};
