//! Mesh gate and execution strategy selection.

use crate::decomposer::analysis::{connector_count, has_complex_keyword, word_count};
use crate::decomposer::ExecutionPlan;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Requests longer than this go through the mesh.
const MESH_WORD_THRESHOLD: usize = 20;

/// Plans with at most this many nodes run as `single`.
const SINGLE_MAX_NODES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Every node one at a time in dependency order.
    Single,
    /// Waves of concurrent parallel groups.
    Parallel,
    /// Ready-queue scheduling mixing groups and single nodes.
    Hybrid,
    /// Critical path only.
    Sequential,
}

impl ExecutionStrategy {
    /// Strategies that run groups concurrently.
    pub fn is_concurrent(&self) -> bool {
        matches!(self, ExecutionStrategy::Parallel | ExecutionStrategy::Hybrid)
    }
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::Single => write!(f, "single"),
            ExecutionStrategy::Parallel => write!(f, "parallel"),
            ExecutionStrategy::Hybrid => write!(f, "hybrid"),
            ExecutionStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

/// Whether a request is worth decomposing.
pub fn should_use_mesh(prompt: &str) -> bool {
    has_complex_keyword(prompt) || word_count(prompt) > MESH_WORD_THRESHOLD || connector_count(prompt) >= 1
}

/// Pick the strategy for a plan.
///
/// `parallel_threshold_percent` is the parallelization benefit above which
/// the plan runs in `parallel` waves.
pub fn select_strategy(plan: &ExecutionPlan, parallel_threshold_percent: f64) -> ExecutionStrategy {
    if plan.node_count() <= SINGLE_MAX_NODES {
        return ExecutionStrategy::Single;
    }
    if plan.parallel_groups.is_empty() {
        return ExecutionStrategy::Sequential;
    }
    if plan.estimates.parallelization_benefit_percent > parallel_threshold_percent {
        return ExecutionStrategy::Parallel;
    }

    let grouped: HashSet<_> = plan.parallel_groups.iter().flatten().collect();
    if plan.dag.nodes().any(|n| !grouped.contains(&n.id)) {
        ExecutionStrategy::Hybrid
    } else {
        ExecutionStrategy::Sequential
    }
}
