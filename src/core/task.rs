//! Task data model for the execution DAG.
//!
//! Task nodes are the atomic units of work assigned to agents. Each node
//! carries its type, estimated cost profile, and the ids of the nodes it
//! depends on. `TaskResult` is the immutable record of one execution.

use crate::agent::{AgentId, Capability};
use serde::{Deserialize, Serialize};

/// Identifier for a task node within a plan.
///
/// Ids are human-readable slugs (`architecture`, `task-2-backend`) so that
/// plans, logs, and checkpoints stay legible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse complexity rating shared by requests and individual nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// Estimated wall-clock duration of a node at this complexity.
    pub fn duration_secs(&self) -> u64 {
        match self {
            Complexity::Simple => 300,
            Complexity::Medium => 600,
            Complexity::Complex => 1200,
        }
    }

    /// Estimated token usage of a node at this complexity.
    pub fn estimated_tokens(&self) -> u64 {
        match self {
            Complexity::Simple => 2_000,
            Complexity::Medium => 5_000,
            Complexity::Complex => 10_000,
        }
    }

    /// Estimated cost in USD of a node at this complexity.
    pub fn estimated_cost_usd(&self) -> f64 {
        match self {
            Complexity::Simple => 0.02,
            Complexity::Medium => 0.05,
            Complexity::Complex => 0.10,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// The kind of work a node represents.
///
/// The type determines which agent capabilities the node needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Analysis,
    Architecture,
    DatabaseDesign,
    BackendApi,
    FrontendUi,
    Authentication,
    Integration,
    Testing,
    Deployment,
    ApiDesign,
    DataModels,
    Endpoints,
    Validation,
    Documentation,
    DataIngestion,
    DataTransformation,
    DataStorage,
    Reporting,
    Implementation,
    SecurityReview,
    Infrastructure,
    ModelTraining,
    MobileUi,
}

impl TaskType {
    /// Slug used for node ids and display.
    pub fn slug(&self) -> &'static str {
        match self {
            TaskType::Analysis => "analysis",
            TaskType::Architecture => "architecture",
            TaskType::DatabaseDesign => "database-design",
            TaskType::BackendApi => "backend-api",
            TaskType::FrontendUi => "frontend-ui",
            TaskType::Authentication => "authentication",
            TaskType::Integration => "integration",
            TaskType::Testing => "testing",
            TaskType::Deployment => "deployment",
            TaskType::ApiDesign => "api-design",
            TaskType::DataModels => "data-models",
            TaskType::Endpoints => "endpoints",
            TaskType::Validation => "validation",
            TaskType::Documentation => "documentation",
            TaskType::DataIngestion => "data-ingestion",
            TaskType::DataTransformation => "data-transformation",
            TaskType::DataStorage => "data-storage",
            TaskType::Reporting => "reporting",
            TaskType::Implementation => "implementation",
            TaskType::SecurityReview => "security-review",
            TaskType::Infrastructure => "infrastructure",
            TaskType::ModelTraining => "model-training",
            TaskType::MobileUi => "mobile-ui",
        }
    }

    /// Capabilities an agent needs to execute a node of this type.
    pub fn required_capabilities(&self) -> Vec<Capability> {
        use Capability::*;
        match self {
            TaskType::Analysis => vec![Analysis],
            TaskType::Architecture => vec![Architecture],
            TaskType::DatabaseDesign => vec![Database],
            TaskType::BackendApi => vec![Backend, ApiDesign],
            TaskType::FrontendUi => vec![Frontend],
            TaskType::Authentication => vec![Security, Backend],
            TaskType::Integration => vec![Backend, Frontend],
            TaskType::Testing => vec![Testing],
            TaskType::Deployment => vec![Devops],
            TaskType::ApiDesign => vec![ApiDesign],
            TaskType::DataModels => vec![Database, Backend],
            TaskType::Endpoints => vec![Backend, ApiDesign],
            TaskType::Validation => vec![Backend, Testing],
            TaskType::Documentation => vec![Documentation],
            TaskType::DataIngestion => vec![DataProcessing],
            TaskType::DataTransformation => vec![DataProcessing],
            TaskType::DataStorage => vec![Database, DataProcessing],
            TaskType::Reporting => vec![DataProcessing, Documentation],
            TaskType::Implementation => vec![CodeGeneration],
            TaskType::SecurityReview => vec![Security],
            TaskType::Infrastructure => vec![Devops],
            TaskType::ModelTraining => vec![MachineLearning],
            TaskType::MobileUi => vec![Mobile, Frontend],
        }
    }

    /// Node type that implements a single required capability in a dynamic chain.
    pub fn for_capability(capability: Capability) -> Self {
        match capability {
            Capability::Analysis => TaskType::Analysis,
            Capability::Architecture => TaskType::Architecture,
            Capability::Frontend => TaskType::FrontendUi,
            Capability::Backend => TaskType::BackendApi,
            Capability::Database => TaskType::DatabaseDesign,
            Capability::ApiDesign => TaskType::ApiDesign,
            Capability::Testing => TaskType::Testing,
            Capability::Devops => TaskType::Infrastructure,
            Capability::Security => TaskType::SecurityReview,
            Capability::Documentation => TaskType::Documentation,
            Capability::DataProcessing => TaskType::DataTransformation,
            Capability::MachineLearning => TaskType::ModelTraining,
            Capability::Mobile => TaskType::MobileUi,
            Capability::CodeGeneration => TaskType::Implementation,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// A single node in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub description: String,
    /// Ids of nodes that must produce a result before this one starts.
    pub dependencies: Vec<TaskId>,
    pub estimated_duration_secs: u64,
    pub complexity: Complexity,
}

impl TaskNode {
    /// Create a node whose duration comes from its complexity.
    pub fn new(
        id: impl Into<TaskId>,
        task_type: TaskType,
        description: &str,
        complexity: Complexity,
    ) -> Self {
        Self {
            id: id.into(),
            task_type,
            description: description.to_string(),
            dependencies: Vec::new(),
            estimated_duration_secs: complexity.duration_secs(),
            complexity,
        }
    }

    /// Override the estimated duration.
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    /// Declare the dependencies of this node.
    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_entry_point(&self) -> bool {
        self.dependencies.is_empty()
    }
}

/// Outcome of executing one node.
///
/// Produced exactly once per executed node and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub success: bool,
    pub result: String,
    pub duration_ms: u64,
    pub tokens: u64,
    pub cost: f64,
    /// Confidence of the producing assignment; zero for failures.
    pub confidence: f64,
    pub error: Option<String>,
}

impl TaskResult {
    /// Build a successful result.
    pub fn success(
        task_id: TaskId,
        agent_id: AgentId,
        output: String,
        duration_ms: u64,
        tokens: u64,
        cost: f64,
        confidence: f64,
    ) -> Self {
        Self {
            task_id,
            agent_id,
            success: true,
            result: output,
            duration_ms,
            tokens,
            cost,
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
        }
    }

    /// Build a failed result. Usage already charged may still be reported.
    pub fn failure(task_id: TaskId, agent_id: AgentId, error: &str, duration_ms: u64) -> Self {
        Self {
            task_id,
            agent_id,
            success: false,
            result: String::new(),
            duration_ms,
            tokens: 0,
            cost: 0.0,
            confidence: 0.0,
            error: Some(error.to_string()),
        }
    }

    /// Attach usage to a failed result.
    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.tokens = tokens;
        self.cost = cost;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display() {
        let id = TaskId::from("backend-api");
        assert_eq!(format!("{}", id), "backend-api");
        assert_eq!(id.as_str(), "backend-api");
    }

    #[test]
    fn test_task_id_serialization_is_transparent() {
        let id = TaskId::from("testing");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"testing\"");
    }

    #[test]
    fn test_complexity_tables_are_monotonic() {
        assert!(Complexity::Simple.duration_secs() < Complexity::Medium.duration_secs());
        assert!(Complexity::Medium.duration_secs() < Complexity::Complex.duration_secs());
        assert!(Complexity::Simple.estimated_tokens() < Complexity::Complex.estimated_tokens());
        assert!(
            Complexity::Simple.estimated_cost_usd() < Complexity::Complex.estimated_cost_usd()
        );
    }

    #[test]
    fn test_complexity_display() {
        assert_eq!(Complexity::Simple.to_string(), "simple");
        assert_eq!(Complexity::Complex.to_string(), "complex");
    }

    #[test]
    fn test_task_type_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskType::DatabaseDesign).unwrap();
        assert_eq!(json, "\"database-design\"");
        assert_eq!(TaskType::DatabaseDesign.slug(), "database-design");
    }

    #[test]
    fn test_every_capability_has_a_task_type() {
        for cap in Capability::all() {
            let task_type = TaskType::for_capability(*cap);
            assert!(task_type.required_capabilities().contains(cap));
        }
    }

    #[test]
    fn test_node_builder() {
        let node = TaskNode::new("frontend-ui", TaskType::FrontendUi, "Build UI", Complexity::Complex)
            .depends_on(["architecture"]);
        assert_eq!(node.estimated_duration_secs, 1200);
        assert_eq!(node.dependencies, vec![TaskId::from("architecture")]);
        assert!(!node.is_entry_point());

        let node = node.with_duration(42);
        assert_eq!(node.estimated_duration_secs, 42);
    }

    #[test]
    fn test_node_serializes_type_field() {
        let node = TaskNode::new("analysis", TaskType::Analysis, "Analyze", Complexity::Simple);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "analysis");
        assert_eq!(json["complexity"], "simple");
    }

    #[test]
    fn test_task_result_success_clamps_confidence() {
        let result = TaskResult::success(
            TaskId::from("a"),
            AgentId::from("agent"),
            "done".to_string(),
            10,
            100,
            0.01,
            1.7,
        );
        assert!(result.success);
        assert_eq!(result.confidence, 1.0);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_task_result_failure() {
        let result = TaskResult::failure(TaskId::from("a"), AgentId::from("agent"), "boom", 5)
            .with_usage(12, 0.001);
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.tokens, 12);
    }
}
