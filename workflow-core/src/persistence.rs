//! Persistence ports — §6, all in-memory reference implementations (§2
//! Persistence ports: "Repository interfaces for workflow instance state,
//! suspension data, async step state... All in-memory reference
//! implementations.").
//!
//! Grounded on `langgraph-checkpoint::traits::CheckpointSaver` /
//! `langgraph-checkpoint::memory::MemorySaver`: a small async trait per
//! concern plus a `DashMap`-backed default implementation, so a host can
//! swap in a real store without touching the engine.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::instance::{AsyncStepState, SuspensionData, WorkflowInstance};

/// §6 "Workflow state: save, findById, findLatestSuspendedByChatId, delete".
#[async_trait]
pub trait WorkflowInstanceRepository: Send + Sync {
    async fn save(&self, instance: WorkflowInstance) -> Result<()>;
    async fn find_by_id(&self, instance_id: &str) -> Result<Option<WorkflowInstance>>;
    async fn find_latest_suspended_by_chat_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<WorkflowInstance>>;
    async fn delete(&self, instance_id: &str) -> Result<()>;
}

/// §6 "Suspension data: save, findByInstanceId, deleteByInstanceId".
#[async_trait]
pub trait SuspensionDataRepository: Send + Sync {
    async fn save(&self, data: SuspensionData) -> Result<()>;
    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<SuspensionData>>;
    async fn delete_by_instance_id(&self, instance_id: &str) -> Result<()>;
}

/// §6 "Async step state: save, findByMessageId, update, deleteByMessageId".
///
/// `find_outstanding_by_instance_id` is an implementation extension beyond
/// the literal port list: both the engine (to notice an instance already
/// has an in-flight async step) and the chat facade (§4.7's "async
/// outstanding" response rows) need to look up the live async state for an
/// instance without already holding its `message_id`.
#[async_trait]
pub trait AsyncStepStateRepository: Send + Sync {
    async fn save(&self, state: AsyncStepState) -> Result<()>;
    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<AsyncStepState>>;
    async fn update(&self, state: AsyncStepState) -> Result<()>;
    async fn delete_by_message_id(&self, message_id: &str) -> Result<()>;
    async fn find_outstanding_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<AsyncStepState>>;
}

/// In-memory reference implementation of [`WorkflowInstanceRepository`].
#[derive(Default)]
pub struct InMemoryWorkflowInstanceRepository {
    rows: DashMap<String, WorkflowInstance>,
}

impl InMemoryWorkflowInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowInstanceRepository for InMemoryWorkflowInstanceRepository {
    async fn save(&self, instance: WorkflowInstance) -> Result<()> {
        self.rows.insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    async fn find_by_id(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        Ok(self.rows.get(instance_id).map(|r| r.clone()))
    }

    async fn find_latest_suspended_by_chat_id(
        &self,
        chat_id: &str,
    ) -> Result<Option<WorkflowInstance>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| {
                r.chat_id.as_deref() == Some(chat_id)
                    && r.status == crate::instance::InstanceStatus::Suspended
            })
            .max_by_key(|r| r.updated_at)
            .map(|r| r.clone()))
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        self.rows.remove(instance_id);
        Ok(())
    }
}

/// In-memory reference implementation of [`SuspensionDataRepository`].
#[derive(Default)]
pub struct InMemorySuspensionDataRepository {
    rows: DashMap<String, SuspensionData>,
}

impl InMemorySuspensionDataRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SuspensionDataRepository for InMemorySuspensionDataRepository {
    async fn save(&self, data: SuspensionData) -> Result<()> {
        self.rows.insert(data.instance_id.clone(), data);
        Ok(())
    }

    async fn find_by_instance_id(&self, instance_id: &str) -> Result<Option<SuspensionData>> {
        Ok(self.rows.get(instance_id).map(|r| r.clone()))
    }

    async fn delete_by_instance_id(&self, instance_id: &str) -> Result<()> {
        self.rows.remove(instance_id);
        Ok(())
    }
}

/// In-memory reference implementation of [`AsyncStepStateRepository`].
#[derive(Default)]
pub struct InMemoryAsyncStepStateRepository {
    rows: DashMap<String, AsyncStepState>,
}

impl InMemoryAsyncStepStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AsyncStepStateRepository for InMemoryAsyncStepStateRepository {
    async fn save(&self, state: AsyncStepState) -> Result<()> {
        self.rows.insert(state.message_id.clone(), state);
        Ok(())
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<AsyncStepState>> {
        Ok(self.rows.get(message_id).map(|r| r.clone()))
    }

    async fn update(&self, state: AsyncStepState) -> Result<()> {
        self.rows.insert(state.message_id.clone(), state);
        Ok(())
    }

    async fn delete_by_message_id(&self, message_id: &str) -> Result<()> {
        self.rows.remove(message_id);
        Ok(())
    }

    async fn find_outstanding_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<AsyncStepState>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .max_by_key(|r| r.updated_at)
            .map(|r| r.clone()))
    }
}

/// Bundle of the three core persistence ports, handed to the engine as one
/// value so callers don't have to thread three `Arc`s individually.
#[derive(Clone)]
pub struct PersistencePorts {
    pub instances: Arc<dyn WorkflowInstanceRepository>,
    pub suspensions: Arc<dyn SuspensionDataRepository>,
    pub async_steps: Arc<dyn AsyncStepStateRepository>,
}

impl PersistencePorts {
    /// Construct a bundle backed entirely by the in-memory reference
    /// implementations (the only backend this crate ships).
    pub fn in_memory() -> Self {
        Self {
            instances: Arc::new(InMemoryWorkflowInstanceRepository::new()),
            suspensions: Arc::new(InMemorySuspensionDataRepository::new()),
            async_steps: Arc::new(InMemoryAsyncStepStateRepository::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;

    #[tokio::test]
    async fn instance_repo_round_trips() {
        let repo = InMemoryWorkflowInstanceRepository::new();
        let instance = WorkflowInstance::new("i1", Some("c1".into()), "wf", "1.0.0", "start");
        repo.save(instance.clone()).await.unwrap();
        let loaded = repo.find_by_id("i1").await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, "i1");
    }

    #[tokio::test]
    async fn finds_latest_suspended_by_chat_id() {
        let repo = InMemoryWorkflowInstanceRepository::new();
        let mut a = WorkflowInstance::new("a", Some("c1".into()), "wf", "1.0.0", "s");
        a.status = InstanceStatus::Suspended;
        let mut b = WorkflowInstance::new("b", Some("c1".into()), "wf", "1.0.0", "s");
        b.status = InstanceStatus::Suspended;
        b.updated_at = a.updated_at + chrono::Duration::seconds(1);
        repo.save(a).await.unwrap();
        repo.save(b).await.unwrap();
        let found = repo
            .find_latest_suspended_by_chat_id("c1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.instance_id, "b");
    }

    #[tokio::test]
    async fn suspension_repo_deletes_on_resume() {
        let repo = InMemorySuspensionDataRepository::new();
        let data = SuspensionData::new("i1", "m1", serde_json::json!({}), "Type", "step1");
        repo.save(data).await.unwrap();
        assert!(repo.find_by_instance_id("i1").await.unwrap().is_some());
        repo.delete_by_instance_id("i1").await.unwrap();
        assert!(repo.find_by_instance_id("i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn async_repo_finds_outstanding_by_instance() {
        let repo = InMemoryAsyncStepStateRepository::new();
        let state = AsyncStepState::new(
            "m1",
            "i1",
            "start",
            "task",
            serde_json::json!({}),
            serde_json::json!({}),
        );
        repo.save(state).await.unwrap();
        let found = repo
            .find_outstanding_by_instance_id("i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.message_id, "m1");
    }
}
