//! Chat facade error type — SPEC_FULL.md §2.1.
//!
//! Wraps `workflow_core::WorkflowError` rather than re-declaring its
//! variants (§7: the facade surfaces uncaught errors as an error
//! `ChatResponse`, it does not reinterpret them), and adds the handful of
//! chat-layer-only failure modes: unknown chat/session ids and a malformed
//! `ChatRequest`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("chat session not found: {0}")]
    SessionNotFound(String),

    #[error("chat message not found: {0}")]
    MessageNotFound(String),

    #[error("no active workflow instance for chat '{0}'")]
    NoActiveInstance(String),

    #[error("chat request missing required field '{0}'")]
    InvalidRequest(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Workflow(#[from] workflow_core::WorkflowError),
}
