//! Task decomposition: request text to an annotated execution plan.
//!
//! The decomposer analyzes the request, instantiates a domain template or a
//! dynamic chain, maps every node to an agent, and annotates the DAG with
//! parallel groups, the critical path, and estimates.

pub mod analysis;
pub mod patterns;

use crate::agent::{
    AgentId, AgentRegistry, CapabilityMatcher, MatchMode, ScoringMatcher, FALLBACK_CONFIDENCE,
};
use crate::core::{Complexity, TaskDag, TaskId, TaskNode, TaskType};
use crate::error::{Error, Result};
use analysis::TaskAnalysis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Agent chosen for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub agent_id: AgentId,
    pub confidence: f64,
    /// True when no registered agent matched and the generic agent was used.
    #[serde(default)]
    pub fallback: bool,
}

impl AgentAssignment {
    pub fn generic() -> Self {
        Self {
            agent_id: AgentId::generic(),
            confidence: FALLBACK_CONFIDENCE,
            fallback: true,
        }
    }
}

/// Time, cost and token estimates for a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEstimates {
    /// Sum of critical-path durations.
    pub duration_secs: u64,
    /// Sum of all node durations.
    pub sequential_duration_secs: u64,
    pub cost_usd: f64,
    pub tokens: u64,
    pub parallelization_benefit_secs: u64,
    pub parallelization_benefit_percent: f64,
}

/// Everything the coordinator needs to run a request.
///
/// Created by the decomposer and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub task: String,
    #[serde(default)]
    pub context: String,
    pub analysis: TaskAnalysis,
    pub dag: TaskDag,
    pub agent_mapping: BTreeMap<TaskId, AgentAssignment>,
    pub parallel_groups: Vec<Vec<TaskId>>,
    pub critical_path: Vec<TaskId>,
    pub estimates: PlanEstimates,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExecutionPlan {
    /// Assignment for a node, or the generic agent when unmapped.
    pub fn assignment(&self, id: &TaskId) -> AgentAssignment {
        self.agent_mapping
            .get(id)
            .cloned()
            .unwrap_or_else(AgentAssignment::generic)
    }

    pub fn node_count(&self) -> usize {
        self.dag.len()
    }
}

/// Builds execution plans from request text.
pub struct TaskDecomposer {
    registry: AgentRegistry,
    matcher: Arc<dyn CapabilityMatcher>,
    mode: MatchMode,
}

impl TaskDecomposer {
    /// Decomposer with the scoring matcher over the given registry.
    pub fn new(registry: AgentRegistry) -> Self {
        Self::with_matcher(registry, Arc::new(ScoringMatcher))
    }

    pub fn with_matcher(registry: AgentRegistry, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        Self {
            registry,
            matcher,
            mode: MatchMode::BestEffort,
        }
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Decompose a request into an execution plan.
    ///
    /// # Errors
    /// Returns `Error::Decomposition` for an empty request or a generated
    /// graph that fails validation.
    pub fn decompose(&self, task: &str, context: &str) -> Result<ExecutionPlan> {
        let task = task.trim();
        if task.is_empty() {
            return Err(Error::Decomposition("empty request".to_string()));
        }

        let analysis = analysis::analyze(task);
        debug!(
            complexity = %analysis.complexity,
            domain = %analysis.domain,
            capabilities = analysis.required_capabilities.len(),
            "Request analyzed"
        );

        let nodes = patterns::template_for(analysis.domain)
            .unwrap_or_else(|| patterns::dynamic_chain(task, &analysis));
        let dag = TaskDag::from_nodes(nodes).map_err(|e| Error::Decomposition(e.to_string()))?;

        let mut warnings = Vec::new();
        let agent_mapping = self.map_agents(&dag, &mut warnings);
        let parallel_groups = dag.parallel_groups();
        let critical_path = dag
            .critical_path()
            .map_err(|e| Error::Decomposition(e.to_string()))?;
        let estimates = estimate(&dag, &parallel_groups, &critical_path);

        info!(
            domain = %analysis.domain,
            nodes = dag.len(),
            groups = parallel_groups.len(),
            duration_secs = estimates.duration_secs,
            "Plan created"
        );

        Ok(ExecutionPlan {
            task: task.to_string(),
            context: context.to_string(),
            analysis,
            dag,
            agent_mapping,
            parallel_groups,
            critical_path,
            estimates,
            warnings,
        })
    }

    /// Assign an agent to every node, falling back to the generic agent.
    fn map_agents(
        &self,
        dag: &TaskDag,
        warnings: &mut Vec<String>,
    ) -> BTreeMap<TaskId, AgentAssignment> {
        let mut mapping = BTreeMap::new();
        for node in dag.nodes() {
            let requirements = node.task_type.required_capabilities();
            let matched =
                self.matcher
                    .find_best_match(&requirements, self.registry.agents(), self.mode);
            let assignment = match matched.best_match {
                Some(agent) if matched.success => AgentAssignment {
                    agent_id: agent.id,
                    confidence: matched.confidence,
                    fallback: false,
                },
                _ => {
                    let message = format!(
                        "No agent matched {} ({}); using {}",
                        node.id,
                        node.task_type,
                        AgentId::generic()
                    );
                    warn!(task = %node.id, "{}", message);
                    warnings.push(message);
                    AgentAssignment::generic()
                }
            };
            mapping.insert(node.id.clone(), assignment);
        }
        mapping
    }
}

/// One-node plan executed by the generic agent.
///
/// Used when decomposition fails and the request still has to run.
pub fn fallback_plan(task: &str, context: &str) -> Result<ExecutionPlan> {
    let mut plan = single_agent_plan(task, context)?;
    plan.warnings
        .push("Decomposition failed; using a single generic task".to_string());
    Ok(plan)
}

/// One-node plan for requests that skip the mesh.
pub fn single_agent_plan(task: &str, context: &str) -> Result<ExecutionPlan> {
    let analysis = analysis::analyze(task);
    let node = TaskNode::new("task", TaskType::Implementation, task, analysis.complexity);
    let id = node.id.clone();
    let dag = TaskDag::from_nodes(vec![node])?;
    let critical_path = vec![id.clone()];
    let estimates = estimate(&dag, &[], &critical_path);

    let mut agent_mapping = BTreeMap::new();
    agent_mapping.insert(id, AgentAssignment::generic());

    Ok(ExecutionPlan {
        task: task.to_string(),
        context: context.to_string(),
        analysis,
        dag,
        agent_mapping,
        parallel_groups: Vec::new(),
        critical_path,
        estimates,
        warnings: Vec::new(),
    })
}

fn estimate(dag: &TaskDag, groups: &[Vec<TaskId>], critical_path: &[TaskId]) -> PlanEstimates {
    let sequential = dag.sequential_duration();
    let benefit: u64 = groups
        .iter()
        .map(|group| {
            let durations: Vec<u64> = group
                .iter()
                .filter_map(|id| dag.get(id))
                .map(|n| n.estimated_duration_secs)
                .collect();
            let sum: u64 = durations.iter().sum();
            sum - durations.iter().copied().max().unwrap_or(0)
        })
        .sum();
    let percent = if sequential == 0 {
        0.0
    } else {
        benefit as f64 / sequential as f64 * 100.0
    };

    let complexities: Vec<Complexity> = dag.nodes().map(|n| n.complexity).collect();
    PlanEstimates {
        duration_secs: dag.duration_of(critical_path),
        sequential_duration_secs: sequential,
        cost_usd: complexities.iter().map(|c| c.estimated_cost_usd()).sum(),
        tokens: complexities.iter().map(|c| c.estimated_tokens()).sum(),
        parallelization_benefit_secs: benefit,
        parallelization_benefit_percent: percent,
    }
}
