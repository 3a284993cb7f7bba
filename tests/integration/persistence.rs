//! Session store and checkpoint tests.

use std::sync::Arc;

use tempfile::TempDir;

use mesh::agent::AgentRegistry;
use mesh::orchestration::OrchestrateOptions;
use mesh::session::{JsonFileStore, SessionManager, SessionStore};
use mesh::{MeshConfig, MeshCoordinator, SessionStatus};

use crate::fixtures::{MockProvider, ECOMMERCE, LOGIN_FORM};

fn file_backed_coordinator(dir: &TempDir) -> MeshCoordinator {
    MeshCoordinator::new(
        &MeshConfig::default(),
        AgentRegistry::with_defaults(),
        Arc::new(MockProvider::new()),
        Arc::new(JsonFileStore::new(dir.path())),
    )
}

/// Test: A finished run can be read back by a fresh store
#[tokio::test]
async fn test_run_survives_restart() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_backed_coordinator(&dir);

    let result = coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), Some("user-7"), None)
        .await;
    assert!(result.success);
    let id = result.mesh.session_id.unwrap();

    let store = JsonFileStore::new(dir.path());
    let session = store.load(&id).await.unwrap().expect("session persisted");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.user_id.as_deref(), Some("user-7"));
    assert_eq!(session.completed_tasks.len(), 8);
    assert!(session.end_time.is_some());

    assert_eq!(store.executions(&id).await.unwrap().len(), 8);
    let checkpoints = store.checkpoints(&id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].session.completed_tasks.len(), 8);
    assert_eq!(store.list().await.unwrap(), vec![id]);
}

/// Test: A new manager reads sessions it did not create
#[tokio::test]
async fn test_manager_loads_from_store() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_backed_coordinator(&dir);
    let result = coordinator
        .orchestrate(LOGIN_FORM, OrchestrateOptions::default(), None, None)
        .await;
    let id = result.mesh.session_id.unwrap();

    let manager = SessionManager::new(Arc::new(JsonFileStore::new(dir.path())));
    let session = manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.final_result.as_deref(), Some(result.result.as_str()));
    assert_eq!(manager.list_sessions().await.unwrap(), vec![id]);

    // terminal sessions stay terminal
    let err = manager.fail_session(&id, "late failure").await.unwrap_err();
    assert!(matches!(err, mesh::Error::SessionTerminal { .. }));
}
