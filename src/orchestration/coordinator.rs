//! MeshCoordinator - the entry point for orchestrated requests.
//!
//! A request passes the mesh gate, is decomposed into a plan, executed with
//! the selected strategy through budgeted provider turns, aggregated and
//! recorded on its session. `orchestrate` never returns an error: failures
//! degrade to a single-agent run and, failing that, to an unsuccessful
//! `MeshResult` carrying the error text.

use crate::agent::{AgentId, AgentRegistry};
use crate::bus::{MessageBus, PublishOptions};
use crate::config::{CoordinatorConfig, MeshConfig};
use crate::core::{TaskId, TaskNode, TaskResult};
use crate::decomposer::{fallback_plan, single_agent_plan, ExecutionPlan, TaskDecomposer};
use crate::error::{Error, Result};
use crate::orchestration::aggregator::ResultAggregator;
use crate::orchestration::scheduler::{ExecutionReport, Scheduler, TaskRunner};
use crate::orchestration::strategy::{select_strategy, should_use_mesh, ExecutionStrategy};
use crate::orchestration::turns::{TokenRates, TurnController, TurnLimits, TurnStatus, UsageReport};
use crate::provider::{ExecutionProvider, ProviderRequest};
use crate::session::{
    MeshSession, SessionId, SessionManager, SessionParams, SessionStore, SessionUpdate,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Bus channel carrying one event per finished task.
pub const TASK_COMPLETED_CHANNEL: &str = "task-completed";

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    pub context: String,
    /// Overrides the configured turn limits for this request.
    pub turn_limits: Option<TurnLimits>,
    /// Skip the mesh gate and always decompose.
    pub force_mesh: bool,
    /// Passed through to every provider request.
    pub provider_options: serde_json::Value,
}

impl OrchestrateOptions {
    pub fn with_context(mut self, context: &str) -> Self {
        self.context = context.to_string();
        self
    }

    pub fn with_turn_limits(mut self, limits: TurnLimits) -> Self {
        self.turn_limits = Some(limits);
        self
    }

    pub fn force_mesh(mut self) -> Self {
        self.force_mesh = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMetadata {
    pub session_id: Option<SessionId>,
    pub strategy: ExecutionStrategy,
    pub execution_time_ms: u64,
    /// Summed task time saved by running tasks concurrently.
    pub time_reduction_ms: u64,
    pub agents_used: Vec<AgentId>,
    pub tasks_executed: usize,
    pub tokens_used: u64,
    pub cost: f64,
    pub confidence: f64,
    #[serde(default)]
    pub skipped: Vec<TaskId>,
    #[serde(default)]
    pub halted: Vec<TaskId>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl MeshMetadata {
    fn empty(session_id: Option<SessionId>) -> Self {
        Self {
            session_id,
            strategy: ExecutionStrategy::Single,
            execution_time_ms: 0,
            time_reduction_ms: 0,
            agents_used: Vec::new(),
            tasks_executed: 0,
            tokens_used: 0,
            cost: 0.0,
            confidence: 0.0,
            skipped: Vec::new(),
            halted: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshResult {
    pub success: bool,
    pub result: String,
    /// True when the request ran through a fallback path.
    pub fallback: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub mesh: MeshMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub sessions_created: u64,
    pub tasks_decomposed: u64,
    pub parallel_executions: u64,
    pub average_time_reduction_ms: f64,
    pub fallbacks: u64,
}

#[derive(Default)]
struct StatsCounter {
    stats: CoordinatorStats,
    total_time_reduction_ms: u64,
}

/// Orchestrates requests across the agent mesh.
pub struct MeshCoordinator {
    decomposer: TaskDecomposer,
    provider: Arc<dyn ExecutionProvider>,
    turns: TurnController,
    bus: MessageBus,
    sessions: SessionManager,
    aggregator: ResultAggregator,
    config: CoordinatorConfig,
    turn_limits: TurnLimits,
    rates: TokenRates,
    stats: Mutex<StatsCounter>,
}

impl MeshCoordinator {
    pub fn new(
        config: &MeshConfig,
        registry: AgentRegistry,
        provider: Arc<dyn ExecutionProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let turns = TurnController::new(config.turns.warnings.clone(), config.turns.rates.clone());
        let bus = MessageBus::new(config.bus.clone());
        let sessions = SessionManager::new(store)
            .with_turns(turns.clone())
            .with_bus(bus.clone());
        Self {
            decomposer: TaskDecomposer::new(registry),
            provider,
            turns,
            bus,
            sessions,
            aggregator: ResultAggregator::new(),
            config: config.coordinator.clone(),
            turn_limits: config.turns.limits.clone(),
            rates: config.turns.rates.clone(),
            stats: Mutex::new(StatsCounter::default()),
        }
    }

    pub fn turns(&self) -> &TurnController {
        &self.turns
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn decomposer(&self) -> &TaskDecomposer {
        &self.decomposer
    }

    /// Decompose without executing.
    pub fn plan(&self, prompt: &str, context: &str) -> Result<ExecutionPlan> {
        self.decomposer.decompose(prompt, context)
    }

    pub fn strategy_for(&self, plan: &ExecutionPlan) -> ExecutionStrategy {
        select_strategy(plan, self.config.parallel_threshold_percent)
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.stats.lock().await.stats.clone()
    }

    /// Stop background bus work.
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
    }

    /// Run a request end to end.
    pub async fn orchestrate(
        &self,
        prompt: &str,
        options: OrchestrateOptions,
        user_id: Option<&str>,
        session_id: Option<SessionId>,
    ) -> MeshResult {
        let started = Instant::now();
        let session = match self.open_session(prompt, &options, user_id, session_id).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Could not open session");
                return failure_result(session_id, &e, started);
            }
        };
        let id = session.id;

        let use_mesh = options.force_mesh || should_use_mesh(prompt);
        let outcome = if use_mesh {
            match self.run_mesh(id, prompt, &options, started).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    warn!(session = %id, error = %e, "Mesh execution failed; falling back to a single agent");
                    self.stats.lock().await.stats.fallbacks += 1;
                    self.run_single_agent(id, prompt, &options, started, true).await
                }
            }
        } else {
            debug!(session = %id, "Request below mesh threshold");
            self.run_single_agent(id, prompt, &options, started, false).await
        };

        self.turns.cleanup(&id).await;
        match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(session = %id, error = %e, "Orchestration failed");
                if let Err(fail_err) = self.sessions.fail_session(&id, &e.to_string()).await {
                    debug!(session = %id, error = %fail_err, "Session already closed");
                }
                let mut result = failure_result(Some(id), &e, started);
                result.fallback = use_mesh;
                result
            }
        }
    }

    /// Create the session (or reuse a live one) and its turn budget.
    async fn open_session(
        &self,
        prompt: &str,
        options: &OrchestrateOptions,
        user_id: Option<&str>,
        session_id: Option<SessionId>,
    ) -> Result<MeshSession> {
        let existing = match session_id {
            Some(id) => match self.sessions.get_session(&id).await {
                Ok(session) => Some(session),
                Err(Error::SessionNotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let session = match existing {
            Some(session) if session.is_terminal() => {
                return Err(Error::SessionTerminal {
                    id: session.id.to_string(),
                    status: session.status,
                });
            }
            Some(session) => session,
            None => {
                let mut params = SessionParams::new(prompt).with_context(&options.context);
                params.id = session_id;
                if let Some(user) = user_id {
                    params = params.with_user(user);
                }
                let session = self.sessions.create_session(params).await?;
                self.stats.lock().await.stats.sessions_created += 1;
                session
            }
        };

        let limits = options
            .turn_limits
            .clone()
            .unwrap_or_else(|| self.turn_limits.clone());
        self.turns.init_session(session.id, limits).await;
        Ok(session)
    }

    async fn run_mesh(
        &self,
        id: SessionId,
        prompt: &str,
        options: &OrchestrateOptions,
        started: Instant,
    ) -> Result<MeshResult> {
        let (plan, fallback) = match self.decomposer.decompose(prompt, &options.context) {
            Ok(plan) => (plan, false),
            Err(e) => {
                warn!(session = %id, error = %e, "Decomposition failed; using fallback plan");
                self.stats.lock().await.stats.fallbacks += 1;
                (fallback_plan(prompt, &options.context)?, true)
            }
        };
        let strategy = if fallback {
            ExecutionStrategy::Single
        } else {
            self.strategy_for(&plan)
        };
        self.execute(id, plan, strategy, options, started, fallback).await
    }

    async fn run_single_agent(
        &self,
        id: SessionId,
        prompt: &str,
        options: &OrchestrateOptions,
        started: Instant,
        fallback: bool,
    ) -> Result<MeshResult> {
        let plan = single_agent_plan(prompt, &options.context)?;
        self.execute(id, plan, ExecutionStrategy::Single, options, started, fallback)
            .await
    }

    async fn execute(
        &self,
        id: SessionId,
        plan: ExecutionPlan,
        strategy: ExecutionStrategy,
        options: &OrchestrateOptions,
        started: Instant,
        fallback: bool,
    ) -> Result<MeshResult> {
        info!(session = %id, %strategy, nodes = plan.node_count(), "Executing request");
        self.sessions
            .update_session(&id, SessionUpdate::plan(plan.clone()))
            .await?;

        let runner = MeshTaskRunner {
            session_id: id,
            plan: &plan,
            provider: self.provider.as_ref(),
            turns: &self.turns,
            sessions: &self.sessions,
            bus: &self.bus,
            rates: &self.rates,
            context_chars: self.config.context_chars,
            provider_options: &options.provider_options,
        };
        let report = Scheduler::new(&plan, &runner).run(strategy).await;

        if let Err(e) = self.sessions.create_checkpoint(&id).await {
            warn!(session = %id, error = %e, "Checkpoint failed");
        }

        let aggregated = self.aggregator.aggregate(&report.results, strategy);
        let mut warnings = plan.warnings.clone();
        // off-path nodes of a sequential run are skipped, not failed
        let clean = report.failed().is_empty() && report.halted.is_empty();
        let (success, error) = match self.stop_reason(&id, &report).await {
            Some(StopReason::Budget(reason)) if clean => {
                info!(session = %id, %reason, skipped = report.skipped.len(), "Run ended by turn budget");
                self.sessions
                    .complete_session_with_reason(&id, &aggregated.content, &reason)
                    .await?;
                warnings.push(reason);
                let success = !report.results.is_empty();
                (success, (!success).then(|| "turn budget exhausted before any task ran".to_string()))
            }
            Some(StopReason::Paused) => {
                info!(session = %id, skipped = report.skipped.len(), "Run stopped by pause");
                (false, Some("session paused before completion".to_string()))
            }
            _ if clean && !report.results.is_empty() => {
                self.sessions.complete_session(&id, &aggregated.content).await?;
                (true, None)
            }
            _ => {
                let reason = failure_reason(&report);
                self.sessions.fail_session(&id, &reason).await?;
                (false, Some(reason))
            }
        };

        let elapsed_ms = millis(started.elapsed());
        let time_reduction_ms = if strategy.is_concurrent() {
            let task_time: u64 = report.results.iter().map(|r| r.duration_ms).sum();
            task_time.saturating_sub(elapsed_ms)
        } else {
            0
        };
        self.record_stats(&plan, strategy, fallback, time_reduction_ms).await;

        let agents_used: BTreeSet<AgentId> =
            report.results.iter().map(|r| r.agent_id.clone()).collect();
        Ok(MeshResult {
            success,
            result: aggregated.content,
            fallback,
            error,
            mesh: MeshMetadata {
                session_id: Some(id),
                strategy,
                execution_time_ms: elapsed_ms,
                time_reduction_ms,
                agents_used: agents_used.into_iter().collect(),
                tasks_executed: report.results.len(),
                tokens_used: report.results.iter().map(|r| r.tokens).sum(),
                cost: report.results.iter().map(|r| r.cost).sum(),
                confidence: aggregated.confidence,
                skipped: report.skipped,
                halted: report.halted,
                warnings,
            },
        })
    }

    /// Why the scheduler stopped early, if it did.
    async fn stop_reason(&self, id: &SessionId, report: &ExecutionReport) -> Option<StopReason> {
        if !report.stopped {
            return None;
        }
        let state = self.turns.state(id).await?;
        match state.status {
            TurnStatus::Paused => Some(StopReason::Paused),
            TurnStatus::Completed => Some(StopReason::Budget(
                state
                    .completion_reason
                    .unwrap_or_else(|| "turn budget closed".to_string()),
            )),
            TurnStatus::Active => None,
        }
    }

    async fn record_stats(
        &self,
        plan: &ExecutionPlan,
        strategy: ExecutionStrategy,
        fallback: bool,
        time_reduction_ms: u64,
    ) {
        let mut counter = self.stats.lock().await;
        if !fallback && plan.node_count() > 1 {
            counter.stats.tasks_decomposed += plan.node_count() as u64;
        }
        if strategy.is_concurrent() {
            counter.stats.parallel_executions += 1;
            counter.total_time_reduction_ms += time_reduction_ms;
            counter.stats.average_time_reduction_ms =
                counter.total_time_reduction_ms as f64 / counter.stats.parallel_executions as f64;
        }
    }
}

enum StopReason {
    Budget(String),
    Paused,
}

/// Runs plan nodes through the provider under the session's turn budget.
struct MeshTaskRunner<'a> {
    session_id: SessionId,
    plan: &'a ExecutionPlan,
    provider: &'a dyn ExecutionProvider,
    turns: &'a TurnController,
    sessions: &'a SessionManager,
    bus: &'a MessageBus,
    rates: &'a TokenRates,
    context_chars: usize,
    provider_options: &'a serde_json::Value,
}

#[async_trait]
impl TaskRunner for MeshTaskRunner<'_> {
    async fn run_task(&self, node: &TaskNode, completed: &HashMap<TaskId, TaskResult>) -> Option<TaskResult> {
        let assignment = self.plan.assignment(&node.id);
        let agent = assignment.agent_id.clone();
        let request = ProviderRequest::new(&node.description, agent.clone())
            .with_context(dependency_context(node, completed, self.context_chars))
            .with_options(self.provider_options.clone());

        debug!(session = %self.session_id, task = %node.id, %agent, "Task started");
        let started = Instant::now();
        let outcome = self
            .turns
            .run_turn(&self.session_id, self.provider.execute(request))
            .await;
        let duration_ms = millis(started.elapsed());

        let result = match outcome {
            Ok((response, _)) => {
                let cost = response
                    .cost_usd
                    .unwrap_or_else(|| self.rates.cost(&response.turn_data()));
                if response.success {
                    TaskResult::success(
                        node.id.clone(),
                        agent.clone(),
                        response.output,
                        duration_ms,
                        response.tokens_used,
                        cost,
                        assignment.confidence,
                    )
                } else {
                    let message = response
                        .error
                        .unwrap_or_else(|| "provider reported a failure".to_string());
                    TaskResult::failure(node.id.clone(), agent.clone(), &message, duration_ms)
                        .with_usage(response.tokens_used, cost)
                }
            }
            Err(Error::BudgetExhausted(_)) => {
                debug!(session = %self.session_id, task = %node.id, "Turn refused");
                return None;
            }
            Err(e) => TaskResult::failure(node.id.clone(), agent.clone(), &e.to_string(), duration_ms),
        };

        if result.success {
            debug!(session = %self.session_id, task = %node.id, duration_ms, "Task completed");
        } else {
            warn!(
                session = %self.session_id,
                task = %node.id,
                error = result.error.as_deref().unwrap_or_default(),
                "Task failed"
            );
        }

        if let Err(e) = self
            .sessions
            .record_agent_execution(&self.session_id, result.clone())
            .await
        {
            warn!(session = %self.session_id, task = %node.id, error = %e, "Execution not recorded");
        }

        let event = serde_json::json!({
            "session_id": self.session_id,
            "task_id": result.task_id,
            "agent_id": result.agent_id,
            "success": result.success,
            "duration_ms": result.duration_ms,
            "tokens": result.tokens,
        });
        self.bus
            .publish(
                TASK_COMPLETED_CHANNEL,
                event,
                PublishOptions::broadcast().from_sender(agent),
            )
            .await;

        Some(result)
    }
}

/// Truncated outputs of the node's successful dependencies.
fn dependency_context(node: &TaskNode, completed: &HashMap<TaskId, TaskResult>, max_chars: usize) -> String {
    node.dependencies
        .iter()
        .filter_map(|dep| completed.get(dep).filter(|r| r.success))
        .map(|r| format!("[{}]: {}", r.task_id, truncate(&r.result, max_chars)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

fn failure_reason(report: &ExecutionReport) -> String {
    if let Some(failed) = report.failed().first() {
        return format!(
            "task {} failed: {}",
            failed.task_id,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    if !report.halted.is_empty() {
        return Error::DependencyDeadlock(report.halted.clone()).to_string();
    }
    if report.results.is_empty() {
        return "no task was executed".to_string();
    }
    format!("{} tasks were not executed", report.skipped.len())
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn failure_result(session_id: Option<SessionId>, error: &Error, started: Instant) -> MeshResult {
    let mut mesh = MeshMetadata::empty(session_id);
    mesh.execution_time_ms = millis(started.elapsed());
    MeshResult {
        success: false,
        result: error.to_string(),
        fallback: false,
        error: Some(error.to_string()),
        mesh,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Complexity;
    use crate::core::TaskType;

    fn node_with_deps(deps: &[&str]) -> TaskNode {
        TaskNode::new("n", TaskType::Implementation, "n", Complexity::Simple).depends_on(deps.iter().copied())
    }

    fn done(id: &str, output: &str, success: bool) -> TaskResult {
        if success {
            TaskResult::success(id.into(), AgentId::from("a"), output.to_string(), 1, 1, 0.0, 0.9)
        } else {
            TaskResult::failure(id.into(), AgentId::from("a"), output, 1)
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("héllo", 2), "hé...");
    }

    #[test]
    fn test_dependency_context_uses_successful_deps_in_order() {
        let mut completed = HashMap::new();
        completed.insert(TaskId::from("b"), done("b", "beta output", true));
        completed.insert(TaskId::from("a"), done("a", "alpha", true));
        completed.insert(TaskId::from("c"), done("c", "broken", false));
        completed.insert(TaskId::from("z"), done("z", "unrelated", true));

        let context = dependency_context(&node_with_deps(&["a", "b", "c"]), &completed, 4);
        assert_eq!(context, "[a]: alph...\n[b]: beta...");
    }

    #[test]
    fn test_failure_reason_names_failed_task() {
        let report = ExecutionReport {
            strategy: ExecutionStrategy::Single,
            results: vec![done("x", "exploded", false)],
            skipped: vec![TaskId::from("y")],
            halted: Vec::new(),
            concurrent_batches: 0,
            stopped: false,
        };
        assert_eq!(failure_reason(&report), "task x failed: exploded");
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::from_micros(999)), 0);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_failure_reason_deadlock() {
        let report = ExecutionReport {
            strategy: ExecutionStrategy::Hybrid,
            results: vec![done("x", "ok", true)],
            skipped: Vec::new(),
            halted: vec![TaskId::from("y")],
            concurrent_batches: 0,
            stopped: false,
        };
        assert!(failure_reason(&report).contains("deadlock"));
    }
}
