//! Scheduler - drives an execution plan with a chosen strategy.
//!
//! The scheduler owns no I/O. Every node is handed to a `TaskRunner`. A failed
//! result only affects the nodes that depend on it (and ends
//! `single`/`sequential` runs). A runner that refuses a node stops the run and
//! every node not yet finished is skipped.

use crate::core::{TaskId, TaskNode, TaskResult};
use crate::decomposer::ExecutionPlan;
use crate::error::Error;
use crate::orchestration::strategy::ExecutionStrategy;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Executes one plan node.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `node`. `completed` holds every result finished so far.
    ///
    /// `None` means the runner admits no more work, for example because the
    /// turn budget is spent.
    async fn run_task(&self, node: &TaskNode, completed: &HashMap<TaskId, TaskResult>) -> Option<TaskResult>;
}

/// What happened to every node of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub strategy: ExecutionStrategy,
    /// Results in completion order.
    pub results: Vec<TaskResult>,
    /// Nodes never started because a dependency failed, or because the
    /// strategy stopped early.
    pub skipped: Vec<TaskId>,
    /// Nodes left pending by a dependency deadlock.
    pub halted: Vec<TaskId>,
    /// Number of concurrent group launches.
    pub concurrent_batches: usize,
    /// The runner refused further work; unfinished nodes were skipped.
    #[serde(default)]
    pub stopped: bool,
}

impl ExecutionReport {
    fn new(strategy: ExecutionStrategy) -> Self {
        Self {
            strategy,
            results: Vec::new(),
            skipped: Vec::new(),
            halted: Vec::new(),
            concurrent_batches: 0,
            stopped: false,
        }
    }

    /// Every node ran and succeeded.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.halted.is_empty() && self.results.iter().all(|r| r.success)
    }

    pub fn failed(&self) -> Vec<&TaskResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }
}

/// Progress of one run.
struct RunState {
    completed: HashMap<TaskId, TaskResult>,
    pending: Vec<TaskId>,
    report: ExecutionReport,
}

impl RunState {
    fn new(plan: &ExecutionPlan, strategy: ExecutionStrategy) -> Self {
        Self {
            completed: HashMap::new(),
            pending: plan.dag.nodes().map(|n| n.id.clone()).collect(),
            report: ExecutionReport::new(strategy),
        }
    }

    fn record(&mut self, result: TaskResult) {
        self.pending.retain(|id| id != &result.task_id);
        self.completed.insert(result.task_id.clone(), result.clone());
        self.report.results.push(result);
    }

    fn succeeded(&self, id: &TaskId) -> bool {
        self.completed.get(id).is_some_and(|r| r.success)
    }

    fn is_pending(&self, id: &TaskId) -> bool {
        self.pending.contains(id)
    }

    fn ready(&self, node: &TaskNode) -> bool {
        self.is_pending(&node.id) && node.dependencies.iter().all(|d| self.succeeded(d))
    }

    fn finish(mut self) -> ExecutionReport {
        self.report.skipped.append(&mut self.pending);
        self.report
    }
}

/// Runs plans against a `TaskRunner`.
pub struct Scheduler<'a> {
    plan: &'a ExecutionPlan,
    runner: &'a dyn TaskRunner,
}

impl<'a> Scheduler<'a> {
    pub fn new(plan: &'a ExecutionPlan, runner: &'a dyn TaskRunner) -> Self {
        Self { plan, runner }
    }

    pub async fn run(&self, strategy: ExecutionStrategy) -> ExecutionReport {
        info!(%strategy, nodes = self.plan.node_count(), "Executing plan");
        let report = match strategy {
            ExecutionStrategy::Single => self.run_single().await,
            ExecutionStrategy::Parallel => self.run_parallel().await,
            ExecutionStrategy::Hybrid => self.run_hybrid().await,
            ExecutionStrategy::Sequential => self.run_sequential().await,
        };
        info!(
            %strategy,
            executed = report.results.len(),
            failed = report.failed().len(),
            skipped = report.skipped.len(),
            halted = report.halted.len(),
            stopped = report.stopped,
            "Plan executed"
        );
        report
    }

    /// Returns whether the run may go on after `node`.
    async fn run_one(&self, state: &mut RunState, node: &TaskNode) -> bool {
        let Some(result) = self.runner.run_task(node, &state.completed).await else {
            self.stop(state, node);
            return false;
        };
        let success = result.success;
        state.record(result);
        success
    }

    fn stop(&self, state: &mut RunState, node: &TaskNode) {
        if !state.report.stopped {
            info!(task = %node.id, "Runner refused task; stopping");
        }
        state.report.stopped = true;
    }

    /// Run nodes concurrently and record their results in node order.
    async fn run_batch(&self, state: &mut RunState, nodes: Vec<&TaskNode>) -> bool {
        if nodes.is_empty() {
            return false;
        }
        debug!(size = nodes.len(), "Launching concurrent batch");
        state.report.concurrent_batches += 1;
        let completed = &state.completed;
        let results = join_all(nodes.iter().map(|node| self.runner.run_task(node, completed))).await;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Some(result) => state.record(result),
                None => self.stop(state, node),
            }
        }
        true
    }

    /// Every node in dependency order, stopping at the first failure.
    async fn run_single(&self) -> ExecutionReport {
        let mut state = RunState::new(self.plan, ExecutionStrategy::Single);
        let order = match self.plan.dag.topological_order() {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Plan has no topological order");
                return state.finish();
            }
        };
        for node in order {
            if !self.run_one(&mut state, node).await {
                break;
            }
        }
        state.finish()
    }

    /// Critical-path nodes in order, stopping at the first failure.
    async fn run_sequential(&self) -> ExecutionReport {
        let mut state = RunState::new(self.plan, ExecutionStrategy::Sequential);
        for id in &self.plan.critical_path {
            let Some(node) = self.plan.dag.get(id) else {
                continue;
            };
            if !self.run_one(&mut state, node).await {
                break;
            }
        }
        state.finish()
    }

    /// Waves: all launchable groups together, then ready non-group nodes.
    async fn run_parallel(&self) -> ExecutionReport {
        let mut state = RunState::new(self.plan, ExecutionStrategy::Parallel);
        let grouped: HashSet<&TaskId> = self.plan.parallel_groups.iter().flatten().collect();

        loop {
            let mut progress = false;

            let wave: Vec<&TaskNode> = self
                .plan
                .parallel_groups
                .iter()
                .filter(|group| self.group_launchable(&state, group))
                .flat_map(|group| group.iter().filter_map(|id| self.plan.dag.get(id)))
                .collect();
            progress |= self.run_batch(&mut state, wave).await;

            for node in self.plan.dag.nodes() {
                if state.report.stopped {
                    break;
                }
                if grouped.contains(&node.id) || !state.ready(node) {
                    continue;
                }
                self.run_one(&mut state, node).await;
                progress = true;
            }

            if !progress || state.report.stopped {
                break;
            }
        }
        state.finish()
    }

    /// A group launches once all members are pending and their shared
    /// dependencies succeeded.
    fn group_launchable(&self, state: &RunState, group: &[TaskId]) -> bool {
        let Some(first) = group.first().and_then(|id| self.plan.dag.get(id)) else {
            return false;
        };
        group.iter().all(|id| state.is_pending(id))
            && first.dependencies.iter().all(|d| state.succeeded(d))
    }

    /// Ready-queue scheduling; complete groups run concurrently.
    async fn run_hybrid(&self) -> ExecutionReport {
        let mut state = RunState::new(self.plan, ExecutionStrategy::Hybrid);

        while !state.report.stopped {
            let ready: Vec<&TaskNode> = self.plan.dag.nodes().filter(|n| state.ready(n)).collect();
            if ready.is_empty() {
                if !state.pending.is_empty() {
                    self.report_stuck(&mut state);
                }
                break;
            }

            let ready_ids: HashSet<&TaskId> = ready.iter().map(|n| &n.id).collect();
            let groups: Vec<&Vec<TaskId>> = self
                .plan
                .parallel_groups
                .iter()
                .filter(|group| group.iter().all(|id| ready_ids.contains(id)))
                .collect();
            let in_groups: HashSet<&TaskId> = groups.iter().copied().flatten().collect();

            let batch: Vec<&TaskNode> = ready
                .iter()
                .copied()
                .filter(|n| in_groups.contains(&n.id))
                .collect();
            self.run_batch(&mut state, batch).await;

            for node in ready.into_iter().filter(|n| !in_groups.contains(&n.id)) {
                if state.report.stopped {
                    break;
                }
                self.run_one(&mut state, node).await;
            }
        }
        state.finish()
    }

    /// Split stuck nodes into those blocked by a failure (skipped) and
    /// those in a dependency deadlock (halted).
    fn report_stuck(&self, state: &mut RunState) {
        let pending: Vec<&TaskNode> = state
            .pending
            .iter()
            .filter_map(|id| self.plan.dag.get(id))
            .collect();
        let failed: HashSet<TaskId> = state
            .completed
            .values()
            .filter(|r| !r.success)
            .map(|r| r.task_id.clone())
            .collect();
        let (blocked, halted) = partition_stuck(&pending, &failed);

        if !halted.is_empty() {
            warn!("{}", Error::DependencyDeadlock(halted.clone()));
        }
        state.pending.clear();
        state.report.skipped.extend(blocked);
        state.report.halted.extend(halted);
    }
}

/// Partition stuck nodes: `.0` transitively depend on a failed node, `.1`
/// are deadlocked.
fn partition_stuck(pending: &[&TaskNode], failed: &HashSet<TaskId>) -> (Vec<TaskId>, Vec<TaskId>) {
    let mut doomed: HashSet<TaskId> = HashSet::new();
    loop {
        let before = doomed.len();
        for node in pending {
            if !doomed.contains(&node.id)
                && node
                    .dependencies
                    .iter()
                    .any(|d| failed.contains(d) || doomed.contains(d))
            {
                doomed.insert(node.id.clone());
            }
        }
        if doomed.len() == before {
            break;
        }
    }
    pending
        .iter()
        .map(|n| n.id.clone())
        .partition(|id| doomed.contains(id))
}
