//! Literal end-to-end scenarios from spec.md §8 that exercise the chat
//! facade rather than the bare engine: a multi-turn suspend/resume
//! conversation (self-assessment) and an async step polled for progress.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use workflow_core::{step_fn, EngineConfig, GraphBuilder, PersistencePorts, SchemaService, StepResult, WorkflowEngine};
use workflow_chat::{
    ChatRequest, ExecutionService, ExecutionServiceConfig, InMemoryAsyncResponseRepository,
    InMemoryChatSessionRepository, InMemoryChatStore,
};

fn service_with(engine: WorkflowEngine, persistence: PersistencePorts) -> ExecutionService {
    ExecutionService::new(
        Arc::new(engine),
        persistence,
        Arc::new(SchemaService::new()),
        Arc::new(InMemoryChatSessionRepository::new()),
        Arc::new(InMemoryChatStore::new()),
        Arc::new(InMemoryAsyncResponseRepository::new()),
        ExecutionServiceConfig::default(),
    )
}

/// Scenario 3: a self-assessment conversation that suspends four times
/// (once for the claimed level, three times for questions) before
/// finishing with a scored summary. Each answer is scored by a `Continue`
/// step in between so its result survives the next suspension in
/// `WorkflowInstance::step_outputs` (§3: `Suspend` itself records nothing,
/// so the running tally has to ride on the preceding `Continue`).
#[tokio::test]
async fn self_assessment_conversation_suspends_through_three_questions_then_scores() {
    let persistence = PersistencePorts::in_memory();
    let engine = WorkflowEngine::new(persistence.clone(), EngineConfig::default());

    let mut builder = GraphBuilder::define("self-assessment", "1.0.0", "Text", "Assessment");
    builder
        .then(
            Some("collect_level".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({
                        "message": "Please assess your proficiency level",
                        "options": ["BEGINNER", "INTERMEDIATE", "ADVANCED"],
                    }),
                    next_input_type: "Text".to_string(),
                    message_id: String::new(),
                })
            }),
            "Text",
            "Text",
        )
        .then(
            Some("record_level".into()),
            step_fn(|input, _ctx| async move {
                let level = input
                    .get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(StepResult::Continue(json!({ "level": level })))
            }),
            "Text",
            "Text",
        )
        .then(
            Some("ask_q1".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({
                        "message": "Question 1: which word means 'quick'?",
                        "options": ["A", "B", "C"],
                    }),
                    next_input_type: "Text".to_string(),
                    message_id: String::new(),
                })
            }),
            "Text",
            "Text",
        )
        .then(
            Some("score_q1".into()),
            step_fn(|input, _ctx| async move {
                let answer = input.get("result").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(StepResult::Continue(
                    json!({ "answer": answer, "correct": answer == "B" }),
                ))
            }),
            "Text",
            "Text",
        )
        .then(
            Some("ask_q2".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({
                        "message": "Question 2: which word means 'slow'?",
                        "options": ["A", "B", "C"],
                    }),
                    next_input_type: "Text".to_string(),
                    message_id: String::new(),
                })
            }),
            "Text",
            "Text",
        )
        .then(
            Some("score_q2".into()),
            step_fn(|input, _ctx| async move {
                let answer = input.get("result").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(StepResult::Continue(
                    json!({ "answer": answer, "correct": answer == "C" }),
                ))
            }),
            "Text",
            "Text",
        )
        .then(
            Some("ask_q3".into()),
            step_fn(|_input, _ctx| async move {
                Ok(StepResult::Suspend {
                    prompt_to_user: json!({
                        "message": "Question 3: which word means 'bright'?",
                        "options": ["A", "B", "C"],
                    }),
                    next_input_type: "Text".to_string(),
                    message_id: String::new(),
                })
            }),
            "Text",
            "Text",
        )
        .then(
            Some("score_q3".into()),
            step_fn(|input, _ctx| async move {
                let answer = input.get("result").and_then(|v| v.as_str()).unwrap_or_default();
                Ok(StepResult::Continue(
                    json!({ "answer": answer, "correct": answer == "X" }),
                ))
            }),
            "Text",
            "Text",
        )
        .then(
            Some("finalize".into()),
            step_fn(|_input, ctx| async move {
                let level: serde_json::Value = ctx.step("record_level").output().unwrap();
                let q1: serde_json::Value = ctx.step("score_q1").output().unwrap();
                let q2: serde_json::Value = ctx.step("score_q2").output().unwrap();
                let q3: serde_json::Value = ctx.step("score_q3").output().unwrap();
                let correct = [&q1, &q2, &q3]
                    .iter()
                    .filter(|r| r["correct"].as_bool().unwrap_or(false))
                    .count();
                let determined_level = if correct >= 2 { "B1" } else { "A2" };
                let feedback = if correct as f64 / 3.0 >= 0.66 {
                    "EXCELLENT"
                } else {
                    "NEEDS_IMPROVEMENT"
                };
                Ok(StepResult::Finish(json!({
                    "selfAssessmentLevel": level["level"],
                    "determinedLevel": determined_level,
                    "correctAnswers": correct,
                    "totalQuestions": 3,
                    "feedback": feedback,
                })))
            }),
            "Text",
            "Assessment",
        );
    engine.register(builder.build().unwrap()).unwrap();

    let svc = service_with(engine, persistence);

    let opening = svc
        .execute_chat(ChatRequest::new("learner").with_workflow_id("self-assessment"))
        .await
        .unwrap();
    assert!(opening.completed);
    assert!(opening.properties.get("message").unwrap().contains("assess"));
    let chat_id = opening.chat_id.clone();

    let q1 = svc
        .execute_chat(
            ChatRequest::new("learner")
                .with_chat_id(chat_id.clone())
                .with_property("result", "INTERMEDIATE"),
        )
        .await
        .unwrap();
    assert!(q1.properties.get("message").unwrap().contains("Question 1"));

    let q2 = svc
        .execute_chat(
            ChatRequest::new("learner")
                .with_chat_id(chat_id.clone())
                .with_property("result", "B"),
        )
        .await
        .unwrap();
    assert!(q2.properties.get("message").unwrap().contains("Question 2"));

    let q3 = svc
        .execute_chat(
            ChatRequest::new("learner")
                .with_chat_id(chat_id.clone())
                .with_property("result", "C"),
        )
        .await
        .unwrap();
    assert!(q3.properties.get("message").unwrap().contains("Question 3"));

    let result = svc
        .execute_chat(
            ChatRequest::new("learner")
                .with_chat_id(chat_id.clone())
                .with_property("result", "A"),
        )
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.percent_complete, 100);
    assert_eq!(
        result.properties.get("selfAssessmentLevel"),
        Some(&"INTERMEDIATE".to_string())
    );
    assert_eq!(result.properties.get("determinedLevel"), Some(&"B1".to_string()));
    assert_eq!(result.properties.get("correctAnswers"), Some(&"2".to_string()));
    assert_eq!(result.properties.get("totalQuestions"), Some(&"3".to_string()));
    assert_eq!(result.properties.get("feedback"), Some(&"EXCELLENT".to_string()));
}

/// Scenario 4: an async step whose handler streams progress through three
/// intermediate stages before finishing; `getAsyncStatus` polls observe
/// each stage at least once and the instance eventually completes.
#[tokio::test]
async fn async_step_reports_progress_through_polling_until_complete() {
    let persistence = PersistencePorts::in_memory();
    let engine = WorkflowEngine::new(persistence.clone(), EngineConfig::default());

    let mut builder = GraphBuilder::define("async-demo", "1.0.0", "Text", "Text");
    builder.then(
        Some("start_processing".into()),
        step_fn(|_input, _ctx| async move {
            Ok(StepResult::Async {
                task_id: "processDataAsync".to_string(),
                timeout_ms: 5_000,
                task_args: json!({ "data": "please process" }),
                immediate_data: json!({ "status": "Initializing", "progressPercent": 0 }),
            })
        }),
        "Text",
        "Text",
    );
    builder.with_async_handler(
        "processDataAsync",
        step_fn(|_input, ctx| async move {
            let reporter = ctx.progress().cloned().expect("async handler has a progress reporter");
            reporter.update_progress(25, "Analyzing data".to_string()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            reporter.update_progress(50, "Processing data".to_string()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            reporter.update_progress(75, "Generating results".to_string()).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(StepResult::Finish(
                json!({ "status": "Completed", "progressPercent": 100 }),
            ))
        }),
    );
    engine.register(builder.build().unwrap()).unwrap();

    let svc = service_with(engine, persistence);

    let opening = svc
        .execute_chat(ChatRequest::new("caller").with_workflow_id("async-demo"))
        .await
        .unwrap();
    assert!(!opening.completed);
    let message_id = opening.id.clone();

    let mut seen_statuses = HashSet::new();
    let mut final_response = opening;
    for _ in 0..200 {
        let polled = svc.get_async_status(&message_id).await.unwrap();
        seen_statuses.insert(polled.properties.get("status").cloned().unwrap_or_default());
        let done = polled.completed;
        final_response = polled;
        if done {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(final_response.completed);
    assert_eq!(final_response.percent_complete, 100);
    assert_eq!(
        final_response.properties.get("status"),
        Some(&"Completed".to_string())
    );
    for expected in ["Analyzing data", "Processing data", "Generating results"] {
        assert!(
            seen_statuses.contains(expected),
            "expected to observe status {expected:?} at least once, saw {seen_statuses:?}"
        );
    }
}
