//! Orchestration layer for the mesh.
//!
//! Strategy selection, plan execution, turn budgets, result aggregation and
//! the `MeshCoordinator` that ties them together.

pub mod aggregator;
pub mod coordinator;
pub mod scheduler;
pub mod strategy;
pub mod turns;

pub use aggregator::{AggregatedResult, AggregationStrategy, ResultAggregator};
pub use coordinator::{
    CoordinatorStats, MeshCoordinator, MeshMetadata, MeshResult, OrchestrateOptions,
    TASK_COMPLETED_CHANNEL,
};
pub use scheduler::{ExecutionReport, Scheduler, TaskRunner};
pub use strategy::{select_strategy, should_use_mesh, ExecutionStrategy};
pub use turns::{
    BudgetDimension, TokenRates, TurnController, TurnData, TurnEvent, TurnLimits, TurnOutcome,
    TurnState, TurnStatus, TurnUsage, UsageReport, WarningThresholds,
};
