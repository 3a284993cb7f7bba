//! Full request execution tests.
//!
//! These tests drive `MeshCoordinator::orchestrate` from prompt to
//! aggregated result and check what lands on the session.

use mesh::core::TaskId;
use mesh::orchestration::{ExecutionStrategy, OrchestrateOptions, TASK_COMPLETED_CHANNEL};
use mesh::session::SessionParams;
use mesh::SessionStatus;

use crate::fixtures::{MeshHarness, MockProvider, Script, ECOMMERCE, LOGIN_FORM};

/// Test: Simple request skips the mesh
/// Given "Create a login form"
/// When orchestrated
/// Then one task runs with the single strategy and the session completes
#[tokio::test]
async fn test_simple_request_runs_single_agent() {
    let harness = MeshHarness::new();

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), Some("user-1"), None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(!result.fallback);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Single);
    assert_eq!(result.mesh.tasks_executed, 1);
    assert_eq!(harness.provider.call_count(), 1);
    assert!(result.result.contains(LOGIN_FORM));

    let id = result.mesh.session_id.expect("session id");
    let session = harness.coordinator.sessions().get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.user_id.as_deref(), Some("user-1"));
    assert_eq!(session.final_result.as_deref(), Some(result.result.as_str()));
    assert_eq!(session.completed_tasks.len(), 1);
}

/// Test: Full-stack request through the mesh
/// Given the e-commerce request
/// When orchestrated
/// Then all 8 template tasks run with the hybrid strategy
#[tokio::test]
async fn test_ecommerce_request_runs_full_mesh() {
    let harness = MeshHarness::new();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Hybrid);
    assert_eq!(result.mesh.tasks_executed, 8);
    assert_eq!(result.mesh.tokens_used, 800);
    assert!(result.mesh.skipped.is_empty());
    assert!(result.mesh.halted.is_empty());
    assert!(result.mesh.agents_used.len() > 1);

    let id = result.mesh.session_id.unwrap();
    let session = harness.coordinator.sessions().get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_tokens, 800);
    assert_eq!(session.execution_plan.as_ref().map(|p| p.node_count()), Some(8));
    assert_eq!(
        session.completed_tasks.last().map(|r| r.task_id.clone()),
        Some(TaskId::from("deployment"))
    );

    let stats = harness.coordinator.stats().await;
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.tasks_decomposed, 8);
    assert_eq!(stats.parallel_executions, 1);
    assert_eq!(stats.fallbacks, 0);
}

/// Test: Dependency outputs flow into later prompts
#[tokio::test]
async fn test_dependency_context_reaches_provider() {
    let harness = MeshHarness::new();

    harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    let requests = harness.provider.requests();
    let backend = requests
        .iter()
        .find(|r| r.prompt == "Implement the backend API")
        .expect("backend task executed");
    assert!(backend.context.starts_with("[database-design]: "));

    let architecture = requests
        .iter()
        .find(|r| r.prompt.starts_with("Design system architecture"))
        .expect("architecture task executed");
    assert!(architecture.context.is_empty());
}

/// Test: A failing task stops its dependents
/// Given a provider that fails the backend task
/// When the e-commerce request runs
/// Then downstream tasks are skipped and the session fails
#[tokio::test]
async fn test_failed_task_fails_session() {
    let harness = MeshHarness::builder()
        .provider(MockProvider::new().with_rule("backend API", Script::Fail("compile error".to_string())))
        .build();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(!result.success);
    assert!(!result.fallback);
    let error = result.error.expect("error text");
    assert!(error.contains("backend-api"), "error: {}", error);
    assert!(error.contains("compile error"));
    assert!(result.mesh.skipped.contains(&TaskId::from("deployment")));
    assert!(result.mesh.skipped.contains(&TaskId::from("authentication")));

    let id = result.mesh.session_id.unwrap();
    let session = harness.coordinator.sessions().get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
}

/// Test: Provider errors become failed results, never panics or `Err`
#[tokio::test]
async fn test_provider_error_is_captured() {
    let harness = MeshHarness::builder()
        .provider(MockProvider::new().with_rule("login", Script::Error("binary crashed".to_string())))
        .build();

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, None)
        .await;

    assert!(!result.success);
    assert!(result.result.contains("binary crashed"));
    assert_eq!(result.mesh.tasks_executed, 1);
}

/// Test: Empty request with a forced mesh degrades to the fallback plan
#[tokio::test]
async fn test_empty_forced_request_uses_fallback_plan() {
    let harness = MeshHarness::new();

    let result = harness
        .coordinator
        .orchestrate("", OrchestrateOptions::default().force_mesh(), None, None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.fallback);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Single);
    assert!(result
        .mesh
        .warnings
        .iter()
        .any(|w| w.contains("Decomposition failed")));
    assert_eq!(harness.coordinator.stats().await.fallbacks, 1);
}

/// Test: A terminal session id is refused without running anything
#[tokio::test]
async fn test_cancelled_session_is_not_reused() {
    let harness = MeshHarness::new();
    let sessions = harness.coordinator.sessions();
    let session = sessions
        .create_session(SessionParams::new("earlier request"))
        .await
        .unwrap();
    sessions.cancel_session(&session.id, "user abort").await.unwrap();

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, Some(session.id))
        .await;

    assert!(!result.success);
    assert!(result.error.is_some());
    assert_eq!(result.mesh.session_id, Some(session.id));
    assert_eq!(harness.provider.call_count(), 0);
}

/// Test: A live session id is reused instead of creating a new one
#[tokio::test]
async fn test_live_session_is_reused() {
    let harness = MeshHarness::new();
    let session = harness
        .coordinator
        .sessions()
        .create_session(SessionParams::new(LOGIN_FORM))
        .await
        .unwrap();

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, Some(session.id))
        .await;

    assert!(result.success);
    assert_eq!(result.mesh.session_id, Some(session.id));
    assert_eq!(harness.coordinator.stats().await.sessions_created, 0);
}

/// Test: Every finished task is announced on the bus
#[tokio::test]
async fn test_task_completed_events_published() {
    let harness = MeshHarness::new();
    let observer = mesh::agent::AgentId::from("observer");
    let bus = harness.coordinator.bus();
    bus.subscribe(&observer, TASK_COMPLETED_CHANNEL).await;
    let mut inbox = bus.connect(&observer).await;

    harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    let mut received = Vec::new();
    while let Ok(message) = inbox.try_recv() {
        received.push(message);
    }
    assert_eq!(received.len(), 8);
    assert!(received.iter().all(|m| m.data["success"] == true));
    assert_eq!(bus.history(TASK_COMPLETED_CHANNEL).await.len(), 8);
}

/// Test: The plan can be inspected without executing it
#[tokio::test]
async fn test_plan_without_execution() {
    let harness = MeshHarness::new();

    let plan = harness.coordinator.plan(ECOMMERCE, "").unwrap();

    assert_eq!(plan.node_count(), 8);
    assert_eq!(plan.critical_path.last(), Some(&TaskId::from("deployment")));
    assert_eq!(harness.coordinator.strategy_for(&plan), ExecutionStrategy::Hybrid);
    assert_eq!(harness.provider.call_count(), 0);
}
