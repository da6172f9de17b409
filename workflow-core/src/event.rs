//! Event publisher port — §6 "Event publisher port (optional)".
//!
//! A capability the engine calls out to on every observable state
//! transition. Wiring a real transport (WebSocket, message bus, ...) is
//! external to this crate; the engine only requires `Send + Sync` and
//! tolerates the port being entirely absent. Grounded on the optional-port
//! shape of `langgraph-checkpoint::traits::CheckpointSaver` (a trait with
//! default method bodies so most implementors only override what they use).

use async_trait::async_trait;
use serde_json::Value;

/// Fan-out target for workflow lifecycle notifications. Every method has a
/// no-op default so an implementor only needs to override the events it
/// cares about.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_workflow_started(&self, instance_id: &str, workflow_id: &str) {
        let _ = (instance_id, workflow_id);
    }

    async fn publish_workflow_resumed(&self, instance_id: &str) {
        let _ = instance_id;
    }

    async fn publish_workflow_suspended(&self, instance_id: &str, message_id: &str) {
        let _ = (instance_id, message_id);
    }

    async fn publish_workflow_completed(&self, instance_id: &str, output: &Value) {
        let _ = (instance_id, output);
    }

    async fn publish_workflow_failed(&self, instance_id: &str, error: &str) {
        let _ = (instance_id, error);
    }

    async fn publish_async_progress(&self, message_id: &str, percent: u8, status_message: &str) {
        let _ = (message_id, percent, status_message);
    }
}

/// No-op publisher used as the engine's default when no sink is wired.
#[derive(Debug, Default)]
pub struct NullEventPublisher;

#[async_trait]
impl EventPublisher for NullEventPublisher {}
