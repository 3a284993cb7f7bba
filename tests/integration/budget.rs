//! Turn budget enforcement across a run.

use mesh::orchestration::{BudgetDimension, OrchestrateOptions, TurnEvent, TurnLimits, TurnStatus};
use mesh::SessionStatus;

use crate::fixtures::{turn_only_limits, MeshHarness, MockProvider, ECOMMERCE, LOGIN_FORM};

/// Test: Running out of turns ends the run as a normal completion
/// Given a 3-turn budget and an 8-task plan
/// When the plan runs
/// Then the fourth task is never started and the session completes with the budget reason
#[tokio::test]
async fn test_turn_budget_exhaustion_stops_run() {
    let harness = MeshHarness::builder().turn_limits(turn_only_limits(3)).build();
    let mut events = harness.coordinator.turns().subscribe();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert!(result.error.is_none());
    assert_eq!(harness.provider.call_count(), 3);
    assert_eq!(result.mesh.tasks_executed, 3);
    let skipped: Vec<&str> = result.mesh.skipped.iter().map(|id| id.as_str()).collect();
    assert!(skipped.contains(&"backend-api"), "skipped: {:?}", skipped);
    assert!(skipped.contains(&"deployment"), "skipped: {:?}", skipped);
    assert_eq!(result.mesh.tasks_executed + skipped.len(), 8);
    assert!(result.mesh.warnings.iter().any(|w| w.contains("budget exhausted")));

    let id = result.mesh.session_id.unwrap();
    let session = harness.coordinator.sessions().get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let completion = session.completion_reason.unwrap();
    assert!(completion.contains("turns"), "completion: {}", completion);
    assert_eq!(session.completed_tasks.len(), 3);
    assert!(session.completed_tasks.iter().all(|r| r.success));
    assert!(session.final_result.is_some());

    let mut completed_reason = None;
    while let Ok(event) = events.try_recv() {
        if let TurnEvent::Completed { reason, .. } = event {
            completed_reason.get_or_insert(reason);
        }
    }
    let reason = completed_reason.expect("budget completion event");
    assert!(reason.contains("turns"), "reason: {}", reason);
}

/// Test: Per-request limits override the configured ones
#[tokio::test]
async fn test_request_limits_override_config() {
    let harness = MeshHarness::new();
    let options = OrchestrateOptions::default().with_turn_limits(turn_only_limits(1));

    let result = harness.coordinator.orchestrate(ECOMMERCE, options, None, None).await;

    assert!(result.success);
    assert_eq!(harness.provider.call_count(), 1);
    assert_eq!(result.mesh.tasks_executed, 1);
    assert_eq!(result.mesh.skipped.len(), 7);
}

/// Test: Token budget warnings fire once
#[tokio::test]
async fn test_token_warning_emitted_once() {
    let harness = MeshHarness::builder()
        .provider(MockProvider::new().with_tokens(450))
        .turn_limits(TurnLimits {
            max_tokens: 1_000,
            ..TurnLimits::default()
        })
        .build();
    let mut events = harness.coordinator.turns().subscribe();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;
    assert!(result.success);
    assert!(harness.provider.call_count() < 8);

    let mut token_warnings = 0;
    while let Ok(event) = events.try_recv() {
        if let TurnEvent::Warning { dimension: BudgetDimension::Tokens, .. } = event {
            token_warnings += 1;
        }
    }
    assert_eq!(token_warnings, 1);
}

/// Test: A finished session leaves no turn state behind
#[tokio::test]
async fn test_turn_state_cleaned_up() {
    let harness = MeshHarness::new();

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, None)
        .await;

    let id = result.mesh.session_id.unwrap();
    assert!(harness.coordinator.turns().state(&id).await.is_none());

    let checkpoints = harness.coordinator.sessions().checkpoints(&id).await.unwrap();
    let turn_state = checkpoints[0].turn_state.as_ref().expect("turn state in checkpoint");
    assert_eq!(turn_state.current.turns, 1);
    assert_eq!(turn_state.status, TurnStatus::Active);
}
