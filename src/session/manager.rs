//! SessionManager - lifecycle, counters and checkpoints for mesh sessions.

use crate::agent::AgentId;
use crate::bus::MessageBus;
use crate::core::TaskResult;
use crate::decomposer::ExecutionPlan;
use crate::error::{Error, Result};
use crate::orchestration::turns::TurnController;
use crate::session::{Checkpoint, MeshSession, SessionId, SessionStatus, SessionStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    /// Caller-chosen id. A fresh id is generated when absent.
    pub id: Option<SessionId>,
    pub user_id: Option<String>,
    pub task: String,
    pub context: String,
}

impl SessionParams {
    pub fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_context(mut self, context: &str) -> Self {
        self.context = context.to_string();
        self
    }
}

/// Partial update for a live session.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub execution_plan: Option<ExecutionPlan>,
    /// Only `Active` and `Paused` are accepted here.
    pub status: Option<SessionStatus>,
    pub context: Option<String>,
    pub active_agents: Vec<AgentId>,
}

impl SessionUpdate {
    pub fn plan(plan: ExecutionPlan) -> Self {
        Self {
            execution_plan: Some(plan),
            ..Default::default()
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = AgentId>) -> Self {
        self.active_agents.extend(agents);
        self
    }
}

/// Owns every mesh session.
///
/// Mutations are serialised behind one async mutex; the store sees each
/// session after every change. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<SessionId, MeshSession>>>,
    store: Arc<dyn SessionStore>,
    turns: Option<TurnController>,
    bus: Option<MessageBus>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            store,
            turns: None,
            bus: None,
        }
    }

    /// Include turn state in checkpoints and close budgets on termination.
    pub fn with_turns(mut self, turns: TurnController) -> Self {
        self.turns = Some(turns);
        self
    }

    /// Include the bus's pending message count in checkpoints.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Create and persist a new active session.
    ///
    /// # Errors
    /// Returns `Error::SessionExists` if the requested id is already taken.
    pub async fn create_session(&self, params: SessionParams) -> Result<MeshSession> {
        let id = params.id.unwrap_or_default();
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) || self.store.load(&id).await?.is_some() {
            return Err(Error::SessionExists(id.to_string()));
        }

        let mut session = MeshSession::new(id, &params.task);
        session.user_id = params.user_id;
        session.context = params.context;

        self.store.save(&session).await?;
        sessions.insert(id, session.clone());
        info!(session = %id, user = ?session.user_id, "Session created");
        Ok(session)
    }

    /// Fetch a session from memory, falling back to the store.
    pub async fn get_session(&self, id: &SessionId) -> Result<MeshSession> {
        let mut sessions = self.sessions.lock().await;
        self.load_locked(&mut sessions, id).await.cloned()
    }

    /// Ids of every persisted session.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        self.store.list().await
    }

    /// Apply a partial update to a live session.
    ///
    /// Pausing also pauses the session's turn budget and reactivating a
    /// paused session resumes it, so a paused session admits no turns.
    pub async fn update_session(&self, id: &SessionId, update: SessionUpdate) -> Result<MeshSession> {
        if matches!(update.status, Some(s) if s.is_terminal()) {
            return Err(Error::Validation(
                "terminal states are set by complete, fail or cancel".to_string(),
            ));
        }
        let requested = update.status;
        let mut previous = SessionStatus::Active;
        let session = self
            .mutate(id, |session| {
                previous = session.status;
                if let Some(plan) = update.execution_plan {
                    session.execution_plan = Some(plan);
                }
                if let Some(status) = update.status {
                    session.status = status;
                }
                if let Some(context) = update.context {
                    session.context = context;
                }
                session.active_agents.extend(update.active_agents);
            })
            .await?;

        if let Some(turns) = &self.turns {
            let transition = match (previous, requested) {
                (SessionStatus::Active, Some(SessionStatus::Paused)) => Some(turns.pause(id).await),
                (SessionStatus::Paused, Some(SessionStatus::Active)) => Some(turns.resume(id).await),
                _ => None,
            };
            match transition {
                None | Some(Ok(_)) | Some(Err(Error::SessionNotFound(_))) => {}
                Some(Err(e)) => warn!(session = %id, error = %e, "Turn budget not updated"),
            }
        }
        Ok(session)
    }

    /// Fold one task execution into the session's counters.
    pub async fn record_agent_execution(&self, id: &SessionId, result: TaskResult) -> Result<MeshSession> {
        let mut sessions = self.sessions.lock().await;
        let mut session = self.load_locked(&mut sessions, id).await?.clone();
        ensure_live(&session)?;

        self.store.append_execution(id, &result).await?;
        session.active_agents.insert(result.agent_id.clone());
        session.total_tokens += result.tokens;
        session.total_cost += result.cost;
        debug!(
            session = %id,
            task = %result.task_id,
            agent = %result.agent_id,
            success = result.success,
            "Execution recorded"
        );
        session.completed_tasks.push(result);

        self.store.save(&session).await?;
        sessions.insert(*id, session.clone());
        Ok(session)
    }

    /// Snapshot the session together with its turn state and bus backlog.
    pub async fn create_checkpoint(&self, id: &SessionId) -> Result<Checkpoint> {
        let turn_state = match &self.turns {
            Some(turns) => turns.state(id).await,
            None => None,
        };
        let pending_messages = match &self.bus {
            Some(bus) => bus.pending_count().await,
            None => 0,
        };

        let mut sessions = self.sessions.lock().await;
        let mut session = self.load_locked(&mut sessions, id).await?.clone();
        session.checkpoint_count += 1;

        let checkpoint = Checkpoint {
            session_id: *id,
            number: session.checkpoint_count,
            timestamp: Utc::now(),
            session: session.clone(),
            turn_state,
            active_agents: session.active_agents.iter().cloned().collect(),
            pending_messages,
        };
        self.store.append_checkpoint(&checkpoint).await?;
        self.store.save(&session).await?;
        sessions.insert(*id, session);
        debug!(session = %id, number = checkpoint.number, "Checkpoint created");
        Ok(checkpoint)
    }

    pub async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        self.get_session(id).await?;
        self.store.checkpoints(id).await
    }

    /// Mark a session completed.
    ///
    /// Completing an already completed session returns it unchanged.
    pub async fn complete_session(&self, id: &SessionId, final_result: &str) -> Result<MeshSession> {
        self.complete_session_with_reason(id, final_result, "completed").await
    }

    /// Mark a session completed, recording why it ended, e.g. an exhausted
    /// turn budget.
    pub async fn complete_session_with_reason(
        &self,
        id: &SessionId,
        final_result: &str,
        reason: &str,
    ) -> Result<MeshSession> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = self.load_locked(&mut sessions, id).await?;
            if session.status == SessionStatus::Completed {
                return Ok(session.clone());
            }
        }
        let final_result = final_result.to_string();
        self.finish(id, SessionStatus::Completed, reason, move |session| {
            session.final_result = Some(final_result);
        })
        .await
    }

    pub async fn fail_session(&self, id: &SessionId, error: &str) -> Result<MeshSession> {
        self.finish(id, SessionStatus::Failed, error, |_| {}).await
    }

    pub async fn cancel_session(&self, id: &SessionId, reason: &str) -> Result<MeshSession> {
        self.finish(id, SessionStatus::Cancelled, reason, |_| {}).await
    }

    async fn finish<F>(&self, id: &SessionId, status: SessionStatus, reason: &str, f: F) -> Result<MeshSession>
    where
        F: FnOnce(&mut MeshSession),
    {
        let session = self
            .mutate(id, |session| {
                session.status = status;
                session.end_time = Some(Utc::now());
                session.completion_reason = Some(reason.to_string());
                f(session);
            })
            .await?;
        info!(session = %id, %status, reason, "Session finished");

        if let Some(turns) = &self.turns {
            match turns.force_complete(id, reason).await {
                Ok(_) | Err(Error::SessionNotFound(_)) => {}
                Err(e) => warn!(session = %id, error = %e, "Failed to close turn budget"),
            }
        }
        Ok(session)
    }

    /// Apply `f` to a copy of a live session, persist it, then publish it.
    ///
    /// A failed save leaves the in-memory session untouched.
    async fn mutate<F>(&self, id: &SessionId, f: F) -> Result<MeshSession>
    where
        F: FnOnce(&mut MeshSession),
    {
        let mut sessions = self.sessions.lock().await;
        let mut session = self.load_locked(&mut sessions, id).await?.clone();
        ensure_live(&session)?;
        f(&mut session);
        self.store.save(&session).await?;
        sessions.insert(*id, session.clone());
        Ok(session)
    }

    async fn load_locked<'a>(
        &self,
        sessions: &'a mut HashMap<SessionId, MeshSession>,
        id: &SessionId,
    ) -> Result<&'a mut MeshSession> {
        if !sessions.contains_key(id) {
            let session = self
                .store
                .load(id)
                .await?
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            sessions.insert(*id, session);
        }
        sessions
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }
}

fn ensure_live(session: &MeshSession) -> Result<()> {
    if session.is_terminal() {
        return Err(Error::SessionTerminal {
            id: session.id.to_string(),
            status: session.status,
        });
    }
    Ok(())
}
