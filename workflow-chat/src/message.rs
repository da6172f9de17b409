//! Chat message model and chat-history store — spec.md §3 `ChatMessage`,
//! §6 "Chat history / chat store: add(message), getById, getAll(chatId),
//! findByChatId(pageable), countByChatId, findRecentByChatId(n)".

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use workflow_core::Schema;

use workflow_core::{Page, PageRequest};

use crate::error::{ChatError, Result};

/// A persisted inbound request, as recorded into chat history (§3
/// `ChatMessage` Request variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestRecord {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub properties: HashMap<String, String>,
}

/// A persisted outbound response, both the chat-history record and the
/// value `executeChat`/`resumeChat`/`getAsyncStatus` return to the caller
/// (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponseRecord {
    pub id: String,
    pub chat_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub language: Option<String>,
    pub properties: HashMap<String, String>,
    pub completed: bool,
    pub percent_complete: u8,
    pub next_input_schema: Option<Schema>,
}

/// Alias matching spec.md's naming for the value `executeChat` et al.
/// return.
pub type ChatResponse = ChatResponseRecord;

/// Sum type over the two kinds of chat-history entries (spec.md §3
/// `ChatMessage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMessage {
    Request(ChatRequestRecord),
    Response(ChatResponseRecord),
}

impl ChatMessage {
    pub fn id(&self) -> &str {
        match self {
            ChatMessage::Request(r) => &r.id,
            ChatMessage::Response(r) => &r.id,
        }
    }

    pub fn chat_id(&self) -> &str {
        match self {
            ChatMessage::Request(r) => &r.chat_id,
            ChatMessage::Response(r) => &r.chat_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ChatMessage::Request(r) => r.timestamp,
            ChatMessage::Response(r) => r.timestamp,
        }
    }

    pub fn as_response(&self) -> Option<&ChatResponseRecord> {
        match self {
            ChatMessage::Response(r) => Some(r),
            _ => None,
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn add(&self, message: ChatMessage) -> Result<()>;
    async fn get_by_id(&self, message_id: &str) -> Result<Option<ChatMessage>>;
    async fn get_all(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;
    async fn find_by_chat_id(&self, chat_id: &str, page: &PageRequest) -> Result<Page<ChatMessage>>;
    async fn count_by_chat_id(&self, chat_id: &str) -> Result<usize>;
    async fn find_recent_by_chat_id(&self, chat_id: &str, n: usize) -> Result<Vec<ChatMessage>>;
}

/// `getById` is keyed purely by message id (spec.md §6), not scoped by
/// chat, because `resumeChat`/`getAsyncStatus` only ever have the message
/// id in hand and must recover the owning chat from it — so the in-memory
/// store indexes by message id globally and keeps a secondary per-chat
/// ordering for the paged/listing operations.
#[derive(Default)]
pub struct InMemoryChatStore {
    by_id: DashMap<String, ChatMessage>,
    by_chat: DashMap<String, Vec<String>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ordered_for_chat(&self, chat_id: &str) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .by_chat
            .get(chat_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.by_id.get(id).map(|m| m.clone()))
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp());
        messages
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn add(&self, message: ChatMessage) -> Result<()> {
        let id = message.id().to_string();
        let chat_id = message.chat_id().to_string();
        self.by_id.insert(id.clone(), message);
        self.by_chat.entry(chat_id).or_default().push(id);
        Ok(())
    }

    async fn get_by_id(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        Ok(self.by_id.get(message_id).map(|m| m.clone()))
    }

    async fn get_all(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self.ordered_for_chat(chat_id))
    }

    async fn find_by_chat_id(&self, chat_id: &str, page: &PageRequest) -> Result<Page<ChatMessage>> {
        let mut ordered = self.ordered_for_chat(chat_id);
        ordered.reverse();
        Ok(page.paginate(&ordered))
    }

    async fn count_by_chat_id(&self, chat_id: &str) -> Result<usize> {
        Ok(self.by_chat.get(chat_id).map(|ids| ids.len()).unwrap_or(0))
    }

    async fn find_recent_by_chat_id(&self, chat_id: &str, n: usize) -> Result<Vec<ChatMessage>> {
        let mut ordered = self.ordered_for_chat(chat_id);
        ordered.reverse();
        ordered.truncate(n);
        Ok(ordered)
    }
}

/// Resolve the chat id a response message belongs to, surfacing
/// [`ChatError::MessageNotFound`] when `message_id` is unknown — the lookup
/// `resumeChat`/`getAsyncStatus` perform first (§4.7).
pub async fn chat_id_for_message(store: &dyn ChatStore, message_id: &str) -> Result<String> {
    store
        .get_by_id(message_id)
        .await?
        .map(|m| m.chat_id().to_string())
        .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(chat_id: &str, id: &str, ts_offset_secs: i64) -> ChatMessage {
        ChatMessage::Response(ChatResponseRecord {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: "u1".to_string(),
            timestamp: Utc::now() + chrono::Duration::seconds(ts_offset_secs),
            workflow_id: "wf".to_string(),
            language: None,
            properties: HashMap::new(),
            completed: true,
            percent_complete: 100,
            next_input_schema: None,
        })
    }

    #[tokio::test]
    async fn get_by_id_finds_message_without_chat_scope() {
        let store = InMemoryChatStore::new();
        store.add(response("c1", "m1", 0)).await.unwrap();
        let found = store.get_by_id("m1").await.unwrap().unwrap();
        assert_eq!(found.chat_id(), "c1");
    }

    #[tokio::test]
    async fn find_by_chat_id_orders_most_recent_first() {
        let store = InMemoryChatStore::new();
        store.add(response("c1", "m1", 0)).await.unwrap();
        store.add(response("c1", "m2", 10)).await.unwrap();
        let page = store
            .find_by_chat_id("c1", &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(page.content[0].id(), "m2");
        assert_eq!(page.total_elements, 2);
    }

    #[tokio::test]
    async fn find_recent_by_chat_id_caps_count() {
        let store = InMemoryChatStore::new();
        for i in 0..5 {
            store
                .add(response("c1", &format!("m{i}"), i))
                .await
                .unwrap();
        }
        let recent = store.find_recent_by_chat_id("c1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id(), "m4");
    }

    #[tokio::test]
    async fn chat_id_for_unknown_message_errors() {
        let store = InMemoryChatStore::new();
        let err = chat_id_for_message(&store, "missing").await.unwrap_err();
        assert!(matches!(err, ChatError::MessageNotFound(_)));
    }
}
