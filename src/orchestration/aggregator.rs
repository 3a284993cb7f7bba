//! ResultAggregator - merges per-task results into one answer.

use crate::core::{TaskId, TaskResult};
use crate::orchestration::strategy::ExecutionStrategy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationStrategy {
    /// Exactly one result, passed through.
    Single,
    /// Nothing succeeded.
    Empty,
    /// Sections ordered by confidence.
    ConfidenceWeighted,
    /// Sections in execution order.
    Sequential,
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationStrategy::Single => write!(f, "single"),
            AggregationStrategy::Empty => write!(f, "empty"),
            AggregationStrategy::ConfidenceWeighted => write!(f, "confidence-weighted"),
            AggregationStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub strategy: AggregationStrategy,
    pub content: String,
    pub confidence: f64,
    /// Tasks whose output made it into `content`.
    pub sources: Vec<TaskId>,
    #[serde(default)]
    pub failed: Vec<TaskId>,
}

#[derive(Debug, Clone, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Merge results produced by a run of `strategy`.
    ///
    /// The aggregate confidence always lies within the range of the
    /// per-result confidences.
    pub fn aggregate(&self, results: &[TaskResult], strategy: ExecutionStrategy) -> AggregatedResult {
        let failed: Vec<TaskId> = results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.task_id.clone())
            .collect();

        if let [only] = results {
            return AggregatedResult {
                strategy: AggregationStrategy::Single,
                content: if only.success {
                    only.result.clone()
                } else {
                    only.error.clone().unwrap_or_default()
                },
                confidence: only.confidence,
                sources: vec![only.task_id.clone()],
                failed,
            };
        }

        let successful: Vec<&TaskResult> = results.iter().filter(|r| r.success).collect();
        if successful.is_empty() {
            return AggregatedResult {
                strategy: AggregationStrategy::Empty,
                content: empty_content(results),
                confidence: 0.0,
                sources: Vec::new(),
                failed,
            };
        }

        if strategy.is_concurrent() {
            confidence_weighted(successful, failed)
        } else {
            sequential(successful, failed)
        }
    }
}

fn confidence_weighted(mut successful: Vec<&TaskResult>, failed: Vec<TaskId>) -> AggregatedResult {
    // stable: equal confidences keep execution order
    successful.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let weight: f64 = successful.iter().map(|r| r.confidence).sum();
    let confidence = if weight > 0.0 {
        successful.iter().map(|r| r.confidence * r.confidence).sum::<f64>() / weight
    } else {
        0.0
    };

    AggregatedResult {
        strategy: AggregationStrategy::ConfidenceWeighted,
        content: sections(&successful, true),
        confidence,
        sources: successful.iter().map(|r| r.task_id.clone()).collect(),
        failed,
    }
}

fn sequential(successful: Vec<&TaskResult>, failed: Vec<TaskId>) -> AggregatedResult {
    let confidence = successful.iter().map(|r| r.confidence).sum::<f64>() / successful.len() as f64;
    AggregatedResult {
        strategy: AggregationStrategy::Sequential,
        content: sections(&successful, false),
        confidence,
        sources: successful.iter().map(|r| r.task_id.clone()).collect(),
        failed,
    }
}

fn sections(results: &[&TaskResult], with_confidence: bool) -> String {
    results
        .iter()
        .map(|r| {
            if with_confidence {
                format!(
                    "## {} ({}, confidence {:.2})\n{}",
                    r.task_id,
                    r.agent_id,
                    r.confidence,
                    r.result.trim_end()
                )
            } else {
                format!("## {} ({})\n{}", r.task_id, r.agent_id, r.result.trim_end())
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn empty_content(results: &[TaskResult]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let errors: Vec<String> = results
        .iter()
        .map(|r| format!("- {}: {}", r.task_id, r.error.as_deref().unwrap_or("failed")))
        .collect();
    format!("No task produced a result.\n{}", errors.join("\n"))
}
