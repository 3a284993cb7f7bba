//! mesh - multi-agent task mesh orchestrator.
//!
//! A request is decomposed into a DAG of typed subtasks, each subtask is
//! mapped to a capable agent, and the plan runs through an execution
//! provider under per-session turn budgets. Agents exchange events over an
//! in-process message bus, and sessions are persisted with checkpoints.

pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod decomposer;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod provider;
pub mod session;

pub use config::MeshConfig;
pub use error::{Error, Result};
pub use orchestration::{MeshCoordinator, MeshResult, OrchestrateOptions};
pub use session::{MeshSession, SessionId, SessionStatus};
