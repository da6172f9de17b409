//! # workflow-chat — chat orchestration facade over `workflow-core`
//!
//! `workflow-chat` is the thin layer SPEC_FULL.md §1 describes as sitting
//! on top of the workflow engine: it maps conversational request/response
//! pairs onto `workflow_core::WorkflowEngine::execute`/`resume` calls and
//! synthesizes a [`message::ChatResponse`] from whatever state the instance
//! lands in (SUSPENDED, an outstanding async step, COMPLETED, or FAILED).
//! It owns no workflow semantics of its own — routing, retries, circuit
//! breaking and persistence of instance state all belong to `workflow-core`.
//!
//! ## Module Organization
//!
//! - [`message`] — `ChatMessage`/`ChatResponse` and the `ChatStore` chat
//!   history port (spec.md §3 `ChatMessage`, §6 chat history operations).
//! - [`session`] — `ChatSession` and its repository port (spec.md §3
//!   `ChatSession`, §6 session operations).
//! - [`async_response`] — the polling-snapshot port `getAsyncStatus` reads
//!   and writes through (spec.md §6 "Async response (for polling)").
//! - [`execution_service`] — the facade itself: `executeChat`, `resumeChat`,
//!   `getAsyncStatus`, session/introspection passthroughs (spec.md §4.7).
//! - [`config`] — facade-level tunables (polling cadence for
//!   `waitForTerminalState`).
//! - [`error`] — the facade's error type, wrapping `workflow_core::WorkflowError`.

pub mod async_response;
pub mod config;
pub mod error;
pub mod execution_service;
pub mod message;
pub mod session;

pub use async_response::{AsyncResponseRepository, InMemoryAsyncResponseRepository};
pub use config::ExecutionServiceConfig;
pub use error::{ChatError, Result};
pub use execution_service::{ChatRequest, ExecutionService};
pub use message::{
    chat_id_for_message, ChatMessage, ChatRequestRecord, ChatResponse, ChatResponseRecord,
    ChatStore, InMemoryChatStore,
};
pub use session::{ChatSession, ChatSessionRepository, InMemoryChatSessionRepository};
