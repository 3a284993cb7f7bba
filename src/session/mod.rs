//! Mesh sessions: the durable record of one orchestrated request.

pub mod manager;
pub mod store;

pub use manager::{SessionManager, SessionParams, SessionUpdate};
pub use store::{JsonFileStore, MemoryStore, SessionStore};

use crate::agent::AgentId;
use crate::core::TaskResult;
use crate::decomposer::ExecutionPlan;
use crate::orchestration::turns::TurnState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Terminal sessions never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Paused => write!(f, "paused"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSession {
    pub id: SessionId,
    #[serde(default)]
    pub user_id: Option<String>,
    pub task: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub execution_plan: Option<ExecutionPlan>,
    /// Agents that executed at least one task.
    #[serde(default)]
    pub active_agents: BTreeSet<AgentId>,
    #[serde(default)]
    pub completed_tasks: Vec<TaskResult>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_reason: Option<String>,
    #[serde(default)]
    pub final_result: Option<String>,
    #[serde(default)]
    pub checkpoint_count: u32,
}

impl MeshSession {
    pub fn new(id: SessionId, task: &str) -> Self {
        Self {
            id,
            user_id: None,
            task: task.to_string(),
            context: String::new(),
            execution_plan: None,
            active_agents: BTreeSet::new(),
            completed_tasks: Vec::new(),
            total_tokens: 0,
            total_cost: 0.0,
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            completion_reason: None,
            final_result: None,
            checkpoint_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration so far, or until the session ended.
    pub fn duration_ms(&self) -> u64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Number of recorded executions that succeeded.
    pub fn successful_tasks(&self) -> usize {
        self.completed_tasks.iter().filter(|r| r.success).count()
    }
}

/// Point-in-time snapshot of a session and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    /// 1-based, increasing per session.
    pub number: u32,
    pub timestamp: DateTime<Utc>,
    pub session: MeshSession,
    #[serde(default)]
    pub turn_state: Option<TurnState>,
    #[serde(default)]
    pub active_agents: Vec<AgentId>,
    #[serde(default)]
    pub pending_messages: usize,
}
