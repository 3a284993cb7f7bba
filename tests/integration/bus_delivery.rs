//! Message bus behaviour alongside the coordinator.

use std::time::Duration;

use mesh::agent::AgentId;
use mesh::orchestration::{OrchestrateOptions, TASK_COMPLETED_CHANNEL};
use mesh::session::SessionParams;
use serde_json::json;
use tokio_test::assert_ok;

use crate::fixtures::{MeshHarness, LOGIN_FORM};

/// Test: Two agents complete a request/response exchange
#[tokio::test]
async fn test_agents_exchange_request_response() {
    let harness = MeshHarness::new();
    let bus = harness.coordinator.bus().clone();
    let frontend = AgentId::from("frontend-specialist");
    let backend = AgentId::from("backend-specialist");

    let mut backend_inbox = bus.connect(&backend).await;
    let responder_bus = bus.clone();
    let responder_id = backend.clone();
    let responder = tokio::spawn(async move {
        let request = backend_inbox.recv().await.expect("request delivered");
        assert_eq!(request.data["question"], "which port?");
        responder_bus
            .send_response(&request, &responder_id, json!({ "port": 8080 }))
            .await
    });

    let response = assert_ok!(
        bus.send_request(
            "api-contract",
            &frontend,
            &backend,
            json!({ "question": "which port?" }),
            Duration::from_secs(2),
        )
        .await
    );

    assert_eq!(response.data["port"], 8080);
    assert_eq!(response.sender, backend);
    let receipt = responder.await.unwrap();
    assert_eq!(receipt.delivered_to, vec![frontend]);
}

/// Test: Checkpoints record messages still waiting for redelivery
#[tokio::test]
async fn test_checkpoint_counts_pending_retries() {
    let harness = MeshHarness::new();
    let bus = harness.coordinator.bus();
    let sessions = harness.coordinator.sessions();

    let receipt = bus
        .send_direct(
            "handoff",
            &AgentId::from("architect"),
            &AgentId::from("offline-agent"),
            json!({ "doc": "schema" }),
        )
        .await;
    assert_eq!(receipt.queued_for, vec![AgentId::from("offline-agent")]);

    let session = sessions.create_session(SessionParams::new("handoff")).await.unwrap();
    let checkpoint = sessions.create_checkpoint(&session.id).await.unwrap();
    assert_eq!(checkpoint.pending_messages, 1);
    assert_eq!(checkpoint.number, 1);

    harness.coordinator.shutdown().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(bus.dead_letters().await.is_empty());
}

/// Test: Orchestration still succeeds after the bus shut down
#[tokio::test]
async fn test_orchestrate_after_bus_shutdown() {
    let harness = MeshHarness::new();
    harness.coordinator.shutdown().await;

    let result = harness
        .coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success);
    assert!(harness.coordinator.bus().is_shut_down());
    assert!(harness
        .coordinator
        .bus()
        .history(TASK_COMPLETED_CHANNEL)
        .await
        .is_empty());
}
