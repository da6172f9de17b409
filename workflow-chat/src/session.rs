//! Chat session model and repository port — spec.md §3 `ChatSession`, §6
//! "Chat session: save, findById, findByUserId(pageable),
//! findActiveByUserId(pageable)".
//!
//! Grounded on `workflow_core::persistence`'s shape: a small async trait per
//! concern plus a `DashMap`-backed in-memory reference implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use workflow_core::{Page, PageRequest};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub chat_id: String,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_message_time: DateTime<Utc>,
    pub archived: bool,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            chat_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            created_at: now,
            last_message_time: now,
            archived: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_message_time = Utc::now();
    }
}

#[async_trait]
pub trait ChatSessionRepository: Send + Sync {
    async fn save(&self, session: ChatSession) -> Result<()>;
    async fn find_by_id(&self, chat_id: &str) -> Result<Option<ChatSession>>;
    async fn find_by_user_id(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<Page<ChatSession>>;
    async fn find_active_by_user_id(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<Page<ChatSession>>;
}

#[derive(Default)]
pub struct InMemoryChatSessionRepository {
    rows: DashMap<String, ChatSession>,
}

impl InMemoryChatSessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatSessionRepository for InMemoryChatSessionRepository {
    async fn save(&self, session: ChatSession) -> Result<()> {
        self.rows.insert(session.chat_id.clone(), session);
        Ok(())
    }

    async fn find_by_id(&self, chat_id: &str) -> Result<Option<ChatSession>> {
        Ok(self.rows.get(chat_id).map(|r| r.clone()))
    }

    async fn find_by_user_id(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<Page<ChatSession>> {
        let mut matching: Vec<ChatSession> = self
            .rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        matching.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(page.paginate(&matching))
    }

    async fn find_active_by_user_id(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<Page<ChatSession>> {
        let mut matching: Vec<ChatSession> = self
            .rows
            .iter()
            .filter(|r| r.user_id == user_id && !r.archived)
            .map(|r| r.clone())
            .collect();
        matching.sort_by(|a, b| b.last_message_time.cmp(&a.last_message_time));
        Ok(page.paginate(&matching))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_sessions_by_user_sorted_by_recency() {
        let repo = InMemoryChatSessionRepository::new();
        let mut older = ChatSession::new("u1", "first");
        older.last_message_time = Utc::now() - chrono::Duration::seconds(10);
        let newer = ChatSession::new("u1", "second");
        repo.save(older.clone()).await.unwrap();
        repo.save(newer.clone()).await.unwrap();

        let page = repo
            .find_by_user_id("u1", &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.content.len(), 2);
        assert_eq!(page.content[0].chat_id, newer.chat_id);
    }

    #[tokio::test]
    async fn archived_sessions_excluded_from_active_listing() {
        let repo = InMemoryChatSessionRepository::new();
        let mut archived = ChatSession::new("u1", "gone");
        archived.archived = true;
        repo.save(archived).await.unwrap();
        repo.save(ChatSession::new("u1", "active")).await.unwrap();

        let page = repo
            .find_active_by_user_id("u1", &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].name, "active");
    }
}
