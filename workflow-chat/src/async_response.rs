//! Async response (polling) port — spec.md §6 "Async response (for
//! polling): save, findByMessageId, update".
//!
//! Distinct from `workflow_core::AsyncStepStateRepository`: that port holds
//! the engine's own view of an in-flight async step (`taskArgs`,
//! `resultData`, raw progress). This port holds the chat facade's freshest
//! *synthesized* [`ChatResponse`] for a given message id, so repeated
//! `getAsyncStatus` polls return the last snapshot `executeChat` or a prior
//! poll produced without recomputing property extraction against
//! `AsyncStepState` that may have already been cleaned up by the time a
//! very late poll arrives.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::message::ChatResponse;

#[async_trait]
pub trait AsyncResponseRepository: Send + Sync {
    async fn save(&self, response: ChatResponse) -> Result<()>;
    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<ChatResponse>>;
    async fn update(&self, response: ChatResponse) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryAsyncResponseRepository {
    rows: DashMap<String, ChatResponse>,
}

impl InMemoryAsyncResponseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AsyncResponseRepository for InMemoryAsyncResponseRepository {
    async fn save(&self, response: ChatResponse) -> Result<()> {
        self.rows.insert(response.id.clone(), response);
        Ok(())
    }

    async fn find_by_message_id(&self, message_id: &str) -> Result<Option<ChatResponse>> {
        Ok(self.rows.get(message_id).map(|r| r.clone()))
    }

    async fn update(&self, response: ChatResponse) -> Result<()> {
        self.rows.insert(response.id.clone(), response);
        Ok(())
    }
}
