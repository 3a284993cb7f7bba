//! Core domain models for mesh orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: task nodes, task results, and the execution DAG.

pub mod dag;
pub mod task;

pub use dag::TaskDag;
pub use task::{Complexity, TaskId, TaskNode, TaskResult, TaskType};
