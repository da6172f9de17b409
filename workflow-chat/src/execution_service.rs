//! Execution service — the chat facade, spec.md §4.7.
//!
//! Maps chat request/response pairs onto `workflow_core::WorkflowEngine`
//! calls: `executeChat` picks `execute` vs `resume` depending on whether a
//! suspended instance already exists for the chat, `resumeChat` recovers
//! the chat from a prior response id, and `getAsyncStatus` re-synthesizes a
//! response snapshot from the freshest `AsyncStepState`. Grounded in shape
//! on `orchestrator::services::workflow::WorkflowServiceImpl` (a service
//! struct holding shared pool/engine handles and mapping requests onto
//! engine calls), adapted from gRPC request/response types to the plain
//! `ChatRequest`/`ChatResponse` values spec.md §4.7 describes — this facade
//! has no transport layer of its own.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use workflow_core::{
    AsyncStepState, InstanceStatus, Page, PageRequest, PersistencePorts, Schema, SchemaService,
    WorkflowEngine, WorkflowError, WorkflowGraph, WorkflowInstance,
};

use crate::async_response::AsyncResponseRepository;
use crate::config::ExecutionServiceConfig;
use crate::error::{ChatError, Result};
use crate::message::{chat_id_for_message, ChatMessage, ChatRequestRecord, ChatResponse};
use crate::session::{ChatSession, ChatSessionRepository};
use crate::ChatStore;

/// Inbound chat request (spec.md §3 `ChatMessage` Request shape plus the
/// routing fields `executeChat` needs: `workflow_id` is required only for a
/// fresh execution — an existing suspended instance supplies its own).
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub user_id: String,
    pub workflow_id: Option<String>,
    pub language: Option<String>,
    pub properties: HashMap<String, String>,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            chat_id: None,
            user_id: user_id.into(),
            workflow_id: None,
            language: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The chat orchestration facade (spec.md §4.7).
pub struct ExecutionService {
    engine: Arc<WorkflowEngine>,
    persistence: PersistencePorts,
    schema_service: Arc<SchemaService>,
    sessions: Arc<dyn ChatSessionRepository>,
    chat_store: Arc<dyn ChatStore>,
    async_responses: Arc<dyn AsyncResponseRepository>,
    config: ExecutionServiceConfig,
}

impl ExecutionService {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        persistence: PersistencePorts,
        schema_service: Arc<SchemaService>,
        sessions: Arc<dyn ChatSessionRepository>,
        chat_store: Arc<dyn ChatStore>,
        async_responses: Arc<dyn AsyncResponseRepository>,
        config: ExecutionServiceConfig,
    ) -> Self {
        Self {
            engine,
            persistence,
            schema_service,
            sessions,
            chat_store,
            async_responses,
            config,
        }
    }

    // ---- Session management (§6) ----------------------------------------

    pub async fn create_chat_session(
        &self,
        user_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<ChatSession> {
        let session = ChatSession::new(user_id, name);
        self.sessions.save(session.clone()).await?;
        Ok(session)
    }

    /// Look up `chat_id` if given; otherwise (or if it names no existing
    /// session) start a fresh one.
    pub async fn get_or_create_session(
        &self,
        user_id: &str,
        chat_id: Option<&str>,
    ) -> Result<ChatSession> {
        if let Some(id) = chat_id {
            if let Some(existing) = self.sessions.find_by_id(id).await? {
                return Ok(existing);
            }
        }
        self.create_chat_session(user_id, "New Chat").await
    }

    pub async fn archive_chat_session(&self, chat_id: &str) -> Result<()> {
        let mut session = self
            .sessions
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| ChatError::SessionNotFound(chat_id.to_string()))?;
        session.archived = true;
        self.sessions.save(session).await?;
        Ok(())
    }

    pub async fn list_chats_for_user(
        &self,
        user_id: &str,
        page: &PageRequest,
    ) -> Result<Page<ChatSession>> {
        self.sessions.find_active_by_user_id(user_id, page).await
    }

    /// §6 "getChatHistory(chatId, pageRequest, includeContext)". When
    /// `include_context` is false, the bulky `properties` payload of each
    /// message is stripped so a listing view can page cheaply.
    pub async fn get_chat_history(
        &self,
        chat_id: &str,
        page: &PageRequest,
        include_context: bool,
    ) -> Result<Page<ChatMessage>> {
        let mut history = self.chat_store.find_by_chat_id(chat_id, page).await?;
        if !include_context {
            for message in &mut history.content {
                strip_context(message);
            }
        }
        Ok(history)
    }

    // ---- Introspection (§6) ----------------------------------------------

    pub fn list_workflows(&self) -> Vec<(String, String)> {
        self.engine.get_registered_workflows()
    }

    pub fn get_workflow_details(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.engine.get_workflow_graph(workflow_id, None)
    }

    pub fn get_initial_schema(&self, workflow_id: &str) -> Option<Arc<Schema>> {
        let graph = self.get_workflow_details(workflow_id)?;
        self.schema_service.schema_for(&graph.input_type).ok()
    }

    pub fn get_workflow_schemas(&self, workflow_id: &str) -> Vec<Arc<Schema>> {
        let Some(graph) = self.get_workflow_details(workflow_id) else {
            return Vec::new();
        };
        let mut names = vec![graph.input_type.clone(), graph.output_type.clone()];
        for node in graph.nodes() {
            names.push(node.input_type.clone());
            names.push(node.output_type.clone());
        }
        names.sort();
        names.dedup();
        names
            .into_iter()
            .filter_map(|name| self.schema_service.schema_for(&name).ok())
            .collect()
    }

    // ---- Chat facade (§4.7) ------------------------------------------------

    /// §4.7 `executeChat`: resumes the chat's outstanding suspension if one
    /// exists, otherwise starts a fresh execution. §7: any uncaught error is
    /// converted into an error `ChatResponse` rather than propagated, and
    /// still recorded into chat history so the user sees a message.
    pub async fn execute_chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        match self.execute_chat_inner(&request).await {
            Ok(response) => Ok(response),
            Err(err) => self.record_error_response(&request, err).await,
        }
    }

    async fn execute_chat_inner(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let session = self
            .get_or_create_session(&request.user_id, request.chat_id.as_deref())
            .await?;
        let chat_id = session.chat_id.clone();

        let (instance, workflow_id) = match self
            .engine
            .find_latest_suspended_by_chat_id(&chat_id)
            .await?
        {
            Some(suspended) => {
                let workflow_id = suspended.workflow_id.clone();
                let instance = self.resume_suspended(&suspended, &request.properties).await?;
                (instance, workflow_id)
            }
            None => {
                let workflow_id = request
                    .workflow_id
                    .clone()
                    .ok_or_else(|| ChatError::InvalidRequest("workflowId".to_string()))?;
                let graph = self
                    .engine
                    .get_workflow_graph(&workflow_id, None)
                    .ok_or_else(|| WorkflowError::NotFound(format!("workflow '{workflow_id}'")))?;
                let input = self.convert_properties(&graph.input_type, &request.properties)?;
                let execution = self
                    .engine
                    .execute(&workflow_id, input, None, Some(chat_id.clone()))
                    .await?;
                let instance = execution.get(self.config.polling.timeout).await?;
                (instance, workflow_id)
            }
        };

        let response = self
            .synthesize_response(&instance, &chat_id, &request.user_id, request.language.clone(), &workflow_id)
            .await?;
        self.record_exchange(&chat_id, request, &response).await?;
        Ok(response)
    }

    /// §4.7 `resumeChat`: recovers the owning chat from the original
    /// response id, then resumes. Errors are handled the same way as
    /// `executeChat` (§7).
    pub async fn resume_chat(
        &self,
        message_id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse> {
        match self.resume_chat_inner(message_id, &request).await {
            Ok(response) => Ok(response),
            Err(err) => self.record_error_response(&request, err).await,
        }
    }

    async fn resume_chat_inner(
        &self,
        message_id: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let chat_id = chat_id_for_message(self.chat_store.as_ref(), message_id).await?;
        let suspended = self
            .engine
            .find_latest_suspended_by_chat_id(&chat_id)
            .await?
            .ok_or_else(|| ChatError::NoActiveInstance(chat_id.clone()))?;
        let workflow_id = suspended.workflow_id.clone();
        let instance = self.resume_suspended(&suspended, &request.properties).await?;
        let response = self
            .synthesize_response(&instance, &chat_id, &request.user_id, request.language.clone(), &workflow_id)
            .await?;
        self.record_exchange(&chat_id, request, &response).await?;
        Ok(response)
    }

    /// §7: "converts any uncaught exception during executeChat/resumeChat
    /// into an error ChatResponse (`{error: message}`) and still persists it
    /// into history so the user sees a message." Falls back to the request's
    /// own `chat_id` (or a synthetic one) when the failure happened before a
    /// session could be resolved.
    async fn record_error_response(
        &self,
        request: &ChatRequest,
        err: ChatError,
    ) -> Result<ChatResponse> {
        let chat_id = request
            .chat_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut properties = HashMap::new();
        properties.insert("error".to_string(), err.to_string());
        let response = ChatResponse {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.clone(),
            user_id: request.user_id.clone(),
            timestamp: chrono::Utc::now(),
            workflow_id: request.workflow_id.clone().unwrap_or_default(),
            language: request.language.clone(),
            properties,
            completed: true,
            percent_complete: 100,
            next_input_schema: None,
        };
        // Best-effort: history is for user visibility, not the source of truth.
        let _ = self.record_exchange(&chat_id, request, &response).await;
        Ok(response)
    }

    /// §4.7 `getAsyncStatus`: re-synthesizes a response snapshot from the
    /// freshest `AsyncStepState`, without touching permanent chat history.
    pub async fn get_async_status(&self, message_id: &str) -> Result<ChatResponse> {
        let original = self
            .chat_store
            .get_by_id(message_id)
            .await?
            .and_then(|m| m.as_response().cloned())
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let async_state = self
            .persistence
            .async_steps
            .find_by_message_id(message_id)
            .await?
            .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
        let instance = self
            .engine
            .get_workflow_instance(&async_state.instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(async_state.instance_id.clone()))?;
        let response = self
            .synthesize_response(
                &instance,
                &original.chat_id,
                &original.user_id,
                original.language.clone(),
                &original.workflow_id,
            )
            .await?;
        self.async_responses.update(response.clone()).await?;
        Ok(response)
    }

    /// §4.7 `waitForTerminalState`: bounded polling loop, returns once the
    /// instance is SUSPENDED, COMPLETED, FAILED, or RUNNING with an
    /// outstanding async step.
    pub async fn wait_for_terminal_state(&self, run_id: &str) -> Result<WorkflowInstance> {
        let deadline = tokio::time::Instant::now() + self.config.polling.timeout;
        loop {
            let instance = self
                .engine
                .get_workflow_instance(run_id)
                .await?
                .ok_or_else(|| WorkflowError::NotFound(run_id.to_string()))?;
            let partial_terminal = matches!(
                instance.status,
                InstanceStatus::Suspended | InstanceStatus::Completed | InstanceStatus::Failed
            ) || (instance.status == InstanceStatus::Running
                && self
                    .persistence
                    .async_steps
                    .find_outstanding_by_instance_id(run_id)
                    .await?
                    .is_some());
            if partial_terminal {
                return Ok(instance);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChatError::Workflow(WorkflowError::Custom(format!(
                    "timed out waiting for a terminal state for run '{run_id}'"
                ))));
            }
            tokio::time::sleep(self.config.polling.interval).await;
        }
    }

    // ---- internals ---------------------------------------------------------

    async fn resume_suspended(
        &self,
        suspended: &WorkflowInstance,
        properties: &HashMap<String, String>,
    ) -> Result<WorkflowInstance> {
        let suspension = self
            .persistence
            .suspensions
            .find_by_instance_id(&suspended.instance_id)
            .await?
            .ok_or_else(|| {
                ChatError::Workflow(WorkflowError::invalid_resume(
                    &suspended.instance_id,
                    "no suspension data for instance",
                ))
            })?;
        let input = self.convert_properties(&suspension.next_input_type, properties)?;
        let execution = self.engine.resume(&suspended.instance_id, input).await?;
        Ok(execution.get(self.config.polling.timeout).await?)
    }

    /// Converts a chat request's raw properties map into the declared input
    /// type, falling back to passing the raw map through (as a JSON object
    /// of strings) when the type has no registered schema (§7
    /// `SchemaUnknown`: "fall back to passing the raw request; log
    /// warning").
    fn convert_properties(
        &self,
        type_name: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Value> {
        if self.schema_service.is_registered(type_name) {
            Ok(self
                .schema_service
                .from_properties_map(type_name, properties)?)
        } else {
            warn!(type_name, "schema unknown, passing raw request properties");
            Ok(serde_json::to_value(properties)?)
        }
    }

    /// Build a `ChatResponse` snapshot from `instance`'s current state per
    /// the §4.7 state → response mapping table.
    async fn synthesize_response(
        &self,
        instance: &WorkflowInstance,
        chat_id: &str,
        user_id: &str,
        language: Option<String>,
        workflow_id: &str,
    ) -> Result<ChatResponse> {
        let outstanding = self
            .persistence
            .async_steps
            .find_outstanding_by_instance_id(&instance.instance_id)
            .await?
            .filter(|state| !state.completed);

        let (id, completed, percent_complete, properties, next_input_schema) =
            if let Some(async_state) = outstanding {
                (
                    async_state.message_id.clone(),
                    false,
                    async_state.percent_complete,
                    async_properties(&self.schema_service, &async_state),
                    None,
                )
            } else {
                match instance.status {
                    InstanceStatus::Suspended => {
                        let suspension = self
                            .persistence
                            .suspensions
                            .find_by_instance_id(&instance.instance_id)
                            .await?
                            .ok_or_else(|| {
                                ChatError::Workflow(WorkflowError::NotFound(format!(
                                    "suspension data for instance '{}'",
                                    instance.instance_id
                                )))
                            })?;
                        let schema = self
                            .schema_service
                            .schema_for(&suspension.next_input_type)
                            .ok()
                            .map(|s| (*s).clone());
                        (
                            suspension.message_id.clone(),
                            true,
                            100,
                            self.schema_service.to_properties_map(&suspension.prompt_to_user),
                            schema,
                        )
                    }
                    InstanceStatus::Completed => {
                        // `current_step_id` names whichever step actually produced the
                        // terminal `Finish` (set on every Continue/Branch/Async
                        // transition before that step runs). Async handlers that
                        // finish directly resume through a `Continuation` that never
                        // touches `execution_history`, so `step_outputs` is the only
                        // source guaranteed to carry that step's real output; the
                        // history lookup is kept as a fallback for older snapshots.
                        let output = instance
                            .current_step_id
                            .as_ref()
                            .and_then(|id| instance.step_outputs.get(id).cloned())
                            .or_else(|| {
                                instance
                                    .execution_history
                                    .last()
                                    .and_then(|r| r.output.clone())
                            })
                            .unwrap_or(Value::Null);
                        (
                            Uuid::new_v4().to_string(),
                            true,
                            100,
                            self.schema_service.to_properties_map(&output),
                            None,
                        )
                    }
                    InstanceStatus::Failed => {
                        let message = instance
                            .error_info
                            .as_ref()
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "unknown error".to_string());
                        let mut properties = HashMap::new();
                        properties.insert("error".to_string(), message);
                        (Uuid::new_v4().to_string(), true, 100, properties, None)
                    }
                    InstanceStatus::Running | InstanceStatus::Created => {
                        (Uuid::new_v4().to_string(), false, 0, HashMap::new(), None)
                    }
                }
            };

        Ok(ChatResponse {
            id,
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: chrono::Utc::now(),
            workflow_id: workflow_id.to_string(),
            language,
            properties,
            completed,
            percent_complete,
            next_input_schema,
        })
    }

    async fn record_exchange(
        &self,
        chat_id: &str,
        request: &ChatRequest,
        response: &ChatResponse,
    ) -> Result<()> {
        let request_record = ChatRequestRecord {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            user_id: request.user_id.clone(),
            timestamp: chrono::Utc::now(),
            properties: request.properties.clone(),
        };
        self.chat_store.add(ChatMessage::Request(request_record)).await?;
        self.chat_store
            .add(ChatMessage::Response(response.clone()))
            .await?;
        if let Some(mut session) = self.sessions.find_by_id(chat_id).await? {
            session.touch();
            self.sessions.save(session).await?;
        }
        Ok(())
    }
}

fn async_properties(schema_service: &SchemaService, state: &AsyncStepState) -> HashMap<String, String> {
    let mut properties = schema_service.to_properties_map(&state.initial_data);
    properties.insert("status".to_string(), state.status_message.clone());
    properties.insert(
        "progressPercent".to_string(),
        state.percent_complete.to_string(),
    );
    properties
}

fn strip_context(message: &mut ChatMessage) {
    match message {
        ChatMessage::Request(r) => r.properties.clear(),
        ChatMessage::Response(r) => r.properties.clear(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workflow_core::{step_fn, EngineConfig, GraphBuilder, StepResult};

    use crate::async_response::InMemoryAsyncResponseRepository;
    use crate::message::InMemoryChatStore;
    use crate::session::InMemoryChatSessionRepository;

    fn service() -> ExecutionService {
        let persistence = PersistencePorts::in_memory();
        let engine = Arc::new(WorkflowEngine::new(persistence.clone(), EngineConfig::default()));
        ExecutionService::new(
            engine,
            persistence,
            Arc::new(SchemaService::new()),
            Arc::new(InMemoryChatSessionRepository::new()),
            Arc::new(InMemoryChatStore::new()),
            Arc::new(InMemoryAsyncResponseRepository::new()),
            ExecutionServiceConfig::default(),
        )
    }

    fn register_echo_workflow(service: &ExecutionService) {
        let mut builder = GraphBuilder::define("echo", "1.0.0", "Text", "Text");
        builder.then(
            Some("shout".into()),
            step_fn(|input, _ctx| async move {
                let text = input
                    .get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_uppercase();
                Ok(StepResult::finish(json!(text)))
            }),
            "Text",
            "Text",
        );
        service.engine.register(builder.build().unwrap()).unwrap();
    }

    fn register_suspending_workflow(service: &ExecutionService) {
        let mut builder = GraphBuilder::define("greeting", "1.0.0", "Text", "Text");
        builder.then(
            Some("ask_name".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({"message": "What's your name?"}),
                    next_input_type: "Text".to_string(),
                    message_id: Uuid::new_v4().to_string(),
                })
            }),
            "Text",
            "Text",
        );
        builder.then(
            Some("greet".into()),
            step_fn(|input, _ctx| async move {
                let name = input.get("result").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(StepResult::finish(json!(format!("Hello, {name}!"))))
            }),
            "Text",
            "Text",
        );
        service.engine.register(builder.build().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn execute_chat_runs_a_fresh_completed_workflow() {
        let svc = service();
        register_echo_workflow(&svc);
        let request = ChatRequest::new("user1")
            .with_workflow_id("echo")
            .with_property("result", "hi");
        let response = svc.execute_chat(request).await.unwrap();
        assert!(response.completed);
        assert_eq!(response.percent_complete, 100);
        assert_eq!(response.properties.get("result"), Some(&"HI".to_string()));
    }

    #[tokio::test]
    async fn execute_chat_without_workflow_id_is_an_error_response() {
        let svc = service();
        let request = ChatRequest::new("user1");
        let response = svc.execute_chat(request).await.unwrap();
        assert!(response.completed);
        assert!(response.properties.contains_key("error"));
    }

    #[tokio::test]
    async fn execute_chat_suspends_then_resumes_via_execute_chat() {
        let svc = service();
        register_suspending_workflow(&svc);
        let first = svc
            .execute_chat(ChatRequest::new("user1").with_workflow_id("greeting"))
            .await
            .unwrap();
        assert!(!first.completed || first.properties.contains_key("message"));
        assert_eq!(first.percent_complete, 100);

        let second = svc
            .execute_chat(
                ChatRequest::new("user1")
                    .with_chat_id(first.chat_id.clone())
                    .with_property("result", "Ada"),
            )
            .await
            .unwrap();
        assert!(second.completed);
        assert_eq!(
            second.properties.get("result"),
            Some(&"Hello, Ada!".to_string())
        );
    }

    #[tokio::test]
    async fn resume_chat_recovers_chat_from_message_id() {
        let svc = service();
        register_suspending_workflow(&svc);
        let first = svc
            .execute_chat(ChatRequest::new("user1").with_workflow_id("greeting"))
            .await
            .unwrap();
        let second = svc
            .resume_chat(&first.id, ChatRequest::new("user1").with_property("result", "Bo"))
            .await
            .unwrap();
        assert!(second.completed);
        assert_eq!(
            second.properties.get("result"),
            Some(&"Hello, Bo!".to_string())
        );
    }

    #[tokio::test]
    async fn resume_chat_with_unknown_message_id_is_an_error_response() {
        let svc = service();
        let response = svc
            .resume_chat("does-not-exist", ChatRequest::new("user1"))
            .await
            .unwrap();
        assert!(response.completed);
        assert!(response.properties.contains_key("error"));
    }

    #[tokio::test]
    async fn error_responses_are_still_recorded_in_chat_history() {
        let svc = service();
        let chat_id = svc.create_chat_session("user1", "test").await.unwrap().chat_id;
        let request = ChatRequest::new("user1").with_chat_id(chat_id.clone());
        let response = svc.execute_chat(request).await.unwrap();
        assert!(response.properties.contains_key("error"));
        let history = svc
            .get_chat_history(&chat_id, &PageRequest::default(), true)
            .await
            .unwrap();
        assert!(history.content.iter().any(|m| m.id() == response.id));
    }
}
