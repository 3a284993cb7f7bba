//! Concurrent group correctness tests.
//!
//! These tests verify that parallel groups really overlap and that the
//! strategies honour dependency order.

use std::collections::HashMap;
use std::time::Duration;

use mesh::core::TaskId;
use mesh::orchestration::{ExecutionStrategy, OrchestrateOptions};

use crate::fixtures::{MeshHarness, MockProvider, ECOMMERCE};

const MULTI_CLAUSE: &str = "Write docs and tests for the parser then review security";

fn completion_order(harness: &MeshHarness) -> HashMap<String, usize> {
    harness
        .provider
        .requests()
        .iter()
        .enumerate()
        .map(|(i, r)| (r.prompt.clone(), i))
        .collect()
}

/// Test: Hybrid runs the predefined group concurrently
/// Given the e-commerce plan with one two-node group
/// When executed with the hybrid strategy
/// Then exactly two provider calls overlap
#[tokio::test]
async fn test_hybrid_group_runs_concurrently() {
    let harness = MeshHarness::builder()
        .provider(MockProvider::new().with_delay(Duration::from_millis(20)))
        .build();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Hybrid);
    assert_eq!(harness.provider.max_concurrency(), 2);
}

/// Test: Parallel waves when the benefit clears the threshold
#[tokio::test]
async fn test_low_threshold_selects_parallel_waves() {
    let harness = MeshHarness::builder()
        .parallel_threshold(1.0)
        .provider(MockProvider::new().with_delay(Duration::from_millis(20)))
        .build();

    let result = harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Parallel);
    assert_eq!(result.mesh.tasks_executed, 8);
    assert_eq!(harness.provider.max_concurrency(), 2);
    assert_eq!(harness.coordinator.stats().await.parallel_executions, 1);
}

/// Test: Dependencies always start after their prerequisites
#[tokio::test]
async fn test_dependency_order_respected() {
    let harness = MeshHarness::new();

    harness
        .coordinator
        .orchestrate(ECOMMERCE, OrchestrateOptions::default(), None, None)
        .await;

    let order = completion_order(&harness);
    let plan = harness.coordinator.plan(ECOMMERCE, "").unwrap();
    for node in plan.dag.nodes() {
        for dep in &node.dependencies {
            let dep_node = plan.dag.get(dep).unwrap();
            assert!(
                order[&dep_node.description] < order[&node.description],
                "{} started before its dependency {}",
                node.id,
                dep
            );
        }
    }
}

/// Test: Ungrouped plans run their critical path in order
#[tokio::test]
async fn test_sequential_strategy_runs_critical_path() {
    let harness = MeshHarness::new();
    let plan = harness.coordinator.plan(MULTI_CLAUSE, "").unwrap();
    assert_eq!(harness.coordinator.strategy_for(&plan), ExecutionStrategy::Sequential);

    let result = harness
        .coordinator
        .orchestrate(MULTI_CLAUSE, OrchestrateOptions::default(), None, None)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.mesh.strategy, ExecutionStrategy::Sequential);
    assert_eq!(result.mesh.tasks_executed, plan.critical_path.len());
    assert_eq!(result.mesh.time_reduction_ms, 0);

    let executed: Vec<TaskId> = {
        let id = result.mesh.session_id.unwrap();
        let session = harness.coordinator.sessions().get_session(&id).await.unwrap();
        session.completed_tasks.iter().map(|r| r.task_id.clone()).collect()
    };
    assert_eq!(executed, plan.critical_path);
}
