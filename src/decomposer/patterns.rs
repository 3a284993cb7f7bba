//! Decomposition patterns: fixed templates and the dynamic chain.

use crate::agent::Capability;
use crate::core::{Complexity, TaskNode, TaskType};
use crate::decomposer::analysis::{Domain, TaskAnalysis};

/// Fixed subtask template for a domain, if one exists.
pub fn template_for(domain: Domain) -> Option<Vec<TaskNode>> {
    match domain {
        Domain::FullStackWeb => Some(full_stack_web()),
        Domain::ApiDevelopment => Some(api_development()),
        Domain::DataProcessing => Some(data_processing()),
        _ => None,
    }
}

fn full_stack_web() -> Vec<TaskNode> {
    use Complexity::*;
    vec![
        TaskNode::new("architecture", TaskType::Architecture, "Design system architecture and technology choices", Complex)
            .with_duration(900),
        TaskNode::new("database-design", TaskType::DatabaseDesign, "Design the database schema and data models", Medium)
            .depends_on(["architecture"]),
        TaskNode::new("frontend-ui", TaskType::FrontendUi, "Build the user interface", Complex)
            .depends_on(["architecture"]),
        TaskNode::new("backend-api", TaskType::BackendApi, "Implement the backend API", Complex)
            .depends_on(["database-design"]),
        TaskNode::new("authentication", TaskType::Authentication, "Add user authentication and authorization", Medium)
            .depends_on(["backend-api"]),
        TaskNode::new("integration", TaskType::Integration, "Connect the frontend to the backend", Complex)
            .with_duration(900)
            .depends_on(["frontend-ui", "authentication"]),
        TaskNode::new("testing", TaskType::Testing, "Write and run end-to-end tests", Medium)
            .depends_on(["integration"]),
        TaskNode::new("deployment", TaskType::Deployment, "Deploy the application", Simple)
            .depends_on(["testing"]),
    ]
}

fn api_development() -> Vec<TaskNode> {
    use Complexity::*;
    vec![
        TaskNode::new("api-design", TaskType::ApiDesign, "Design resources, routes and contracts", Medium),
        TaskNode::new("data-models", TaskType::DataModels, "Define data models and persistence", Medium)
            .depends_on(["api-design"]),
        TaskNode::new("endpoints", TaskType::Endpoints, "Implement the endpoints", Complex)
            .depends_on(["data-models"]),
        TaskNode::new("validation", TaskType::Validation, "Add request validation and error handling", Medium)
            .depends_on(["endpoints"]),
        TaskNode::new("documentation", TaskType::Documentation, "Document the API", Simple)
            .depends_on(["endpoints"]),
        TaskNode::new("testing", TaskType::Testing, "Test the API", Medium)
            .depends_on(["validation", "documentation"]),
    ]
}

fn data_processing() -> Vec<TaskNode> {
    use Complexity::*;
    vec![
        TaskNode::new("data-ingestion", TaskType::DataIngestion, "Ingest data from the sources", Medium),
        TaskNode::new("data-validation", TaskType::Validation, "Validate and clean incoming records", Simple)
            .depends_on(["data-ingestion"]),
        TaskNode::new("data-transformation", TaskType::DataTransformation, "Transform records into the target shape", Complex)
            .with_duration(900)
            .depends_on(["data-ingestion"]),
        TaskNode::new("data-storage", TaskType::DataStorage, "Store processed data", Medium)
            .depends_on(["data-validation", "data-transformation"]),
        TaskNode::new("reporting", TaskType::Reporting, "Produce reports over the stored data", Medium)
            .depends_on(["data-storage"]),
    ]
}

/// Linear chain: analysis, one node per capability, optional integration.
///
/// Capability nodes are capped so the chain stays within the scope's
/// maximum task count, with at least one capability node.
pub fn dynamic_chain(task: &str, analysis: &TaskAnalysis) -> Vec<TaskNode> {
    let complexity = analysis.complexity;
    let mut nodes = vec![TaskNode::new(
        "analysis",
        TaskType::Analysis,
        &format!("Analyze requirements: {}", task),
        Complexity::Simple,
    )];

    let reserved = if complexity == Complexity::Complex { 2 } else { 1 };
    let room = analysis.scope.max_tasks.saturating_sub(reserved).max(1);

    let capabilities: Vec<Capability> = analysis
        .required_capabilities
        .iter()
        .copied()
        .filter(|c| *c != Capability::Analysis)
        .take(room)
        .collect();
    let capabilities = if capabilities.is_empty() {
        vec![Capability::CodeGeneration]
    } else {
        capabilities
    };

    for (i, cap) in capabilities.iter().enumerate() {
        let task_type = TaskType::for_capability(*cap);
        let previous = nodes[nodes.len() - 1].id.clone();
        nodes.push(
            TaskNode::new(
                format!("task-{}-{}", i + 1, task_type.slug()),
                task_type,
                &format!("Handle {} work for: {}", cap, task),
                complexity,
            )
            .depends_on([previous]),
        );
    }

    if complexity == Complexity::Complex && nodes.len() > 2 {
        let last_two = [
            nodes[nodes.len() - 2].id.clone(),
            nodes[nodes.len() - 1].id.clone(),
        ];
        nodes.push(
            TaskNode::new(
                "integration",
                TaskType::Integration,
                "Integrate the pieces into one deliverable",
                Complexity::Medium,
            )
            .depends_on(last_two),
        );
    }

    nodes
}
