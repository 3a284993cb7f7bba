//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! The DAG is built once per request from a list of `TaskNode`s and is
//! read-only afterwards. Edges run from a dependency to its dependent, so
//! a node's incoming neighbors are the nodes it waits for.

use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// The task dependency graph.
///
/// Nodes live in a petgraph `DiGraph` arena in insertion order; `task_index`
/// maps ids to arena slots for fast lookups.
#[derive(Clone)]
pub struct TaskDag {
    /// The underlying directed graph.
    graph: DiGraph<TaskNode, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDag {
    /// Build a DAG from nodes whose `dependencies` reference each other.
    ///
    /// # Errors
    /// Returns `Error::Validation` if:
    /// - two nodes share an id
    /// - a dependency names a node that is not in the list
    /// - the dependencies form a cycle
    pub fn from_nodes(nodes: Vec<TaskNode>) -> Result<Self> {
        let mut dag = Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        };

        for node in nodes {
            if dag.task_index.contains_key(&node.id) {
                return Err(Error::Validation(format!("Duplicate task id {}", node.id)));
            }
            let id = node.id.clone();
            let index = dag.graph.add_node(node);
            dag.task_index.insert(id, index);
        }

        let edges: Vec<(TaskId, TaskId)> = dag
            .graph
            .node_weights()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |dep| (dep.clone(), node.id.clone()))
            })
            .collect();
        for (from, to) in edges {
            dag.add_dependency(&from, &to)?;
        }

        Ok(dag)
    }

    /// Add an edge `from -> to`, rejecting unknown ids and cycles.
    fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = *self.task_index.get(from).ok_or_else(|| {
            Error::Validation(format!("Task {} depends on unknown task {}", to, from))
        })?;
        let to_index = *self
            .task_index
            .get(to)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in DAG", to)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        // Temporarily add the edge to check for cycles
        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "Dependency from {} to {} would create a cycle",
                from, to
            )));
        }

        Ok(())
    }

    /// Get a node by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All edges as `(dependency, dependent)` pairs.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.graph
            .edge_indices()
            .filter_map(|edge| {
                let (from, to) = self.graph.edge_endpoints(edge)?;
                Some((
                    self.graph.node_weight(from)?.id.clone(),
                    self.graph.node_weight(to)?.id.clone(),
                ))
            })
            .collect()
    }

    /// Nodes with no dependencies.
    pub fn entry_points(&self) -> Vec<TaskId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Nodes nothing depends on.
    pub fn exit_points(&self) -> Vec<TaskId> {
        self.nodes_without(Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, direction)
                    .next()
                    .is_none()
            })
            .filter_map(|index| self.graph.node_weight(index).map(|n| n.id.clone()))
            .collect()
    }

    /// Nodes the given node waits for, in declaration order.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.get(id)
            .map(|node| node.dependencies.iter().filter_map(|d| self.get(d)).collect())
            .unwrap_or_default()
    }

    /// Nodes that wait for the given node.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .filter_map(|neighbor| self.graph.node_weight(neighbor))
                .collect(),
            None => Vec::new(),
        }
    }

    // ========== Scheduling Operations ==========

    /// Nodes not yet completed whose dependencies are all in `completed`.
    pub fn ready_tasks<'a>(&'a self, completed: &HashSet<TaskId>) -> Vec<&'a TaskNode> {
        self.graph
            .node_weights()
            .filter(|node| !completed.contains(&node.id))
            .filter(|node| node.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }

    /// Nodes in an order where each one follows all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Validation(format!("Cycle detected at task: {}", id))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Groups of two or more nodes with identical dependency sets.
    ///
    /// Group order and member order follow insertion order.
    pub fn parallel_groups(&self) -> Vec<Vec<TaskId>> {
        let mut groups: Vec<(BTreeSet<&TaskId>, Vec<TaskId>)> = Vec::new();
        for node in self.graph.node_weights() {
            let deps: BTreeSet<&TaskId> = node.dependencies.iter().collect();
            match groups.iter_mut().find(|(key, _)| *key == deps) {
                Some((_, members)) => members.push(node.id.clone()),
                None => groups.push((deps, vec![node.id.clone()])),
            }
        }
        groups
            .into_iter()
            .map(|(_, members)| members)
            .filter(|members| members.len() > 1)
            .collect()
    }

    /// Longest chain of estimated durations from an entry point to an exit.
    ///
    /// Ties pick the earliest inserted node, and the first declared
    /// dependency among equally long predecessors.
    pub fn critical_path(&self) -> Result<Vec<TaskId>> {
        let order = self.topological_order()?;
        let mut longest: HashMap<&TaskId, u64> = HashMap::new();
        let mut predecessor: HashMap<&TaskId, &TaskId> = HashMap::new();

        for node in order {
            let mut best: Option<(&TaskId, u64)> = None;
            for dep in &node.dependencies {
                let value = longest.get(dep).copied().unwrap_or(0);
                if best.map_or(true, |(_, current)| value > current) {
                    best = Some((dep, value));
                }
            }
            let base = best.map_or(0, |(_, value)| value);
            longest.insert(&node.id, base + node.estimated_duration_secs);
            if let Some((dep, _)) = best {
                predecessor.insert(&node.id, dep);
            }
        }

        let mut end: Option<(&TaskId, u64)> = None;
        for node in self.graph.node_weights() {
            let value = longest.get(&node.id).copied().unwrap_or(0);
            if end.map_or(true, |(_, current)| value > current) {
                end = Some((&node.id, value));
            }
        }

        let mut path = Vec::new();
        let mut cursor = end.map(|(id, _)| id);
        while let Some(id) = cursor {
            path.push(id.clone());
            cursor = predecessor.get(id).copied();
        }
        path.reverse();
        Ok(path)
    }

    /// Sum of the estimated durations of the given nodes.
    pub fn duration_of(&self, ids: &[TaskId]) -> u64 {
        ids.iter()
            .filter_map(|id| self.get(id))
            .map(|n| n.estimated_duration_secs)
            .sum()
    }

    /// Sum of every node's estimated duration.
    pub fn sequential_duration(&self) -> u64 {
        self.graph
            .node_weights()
            .map(|n| n.estimated_duration_secs)
            .sum()
    }
}

impl std::fmt::Debug for TaskDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDag")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

/// Serialized form of a DAG. Only `nodes` is read back; the rest is derived.
#[derive(Serialize, Deserialize)]
struct DagRepr {
    nodes: Vec<TaskNode>,
    #[serde(default)]
    edges: Vec<(TaskId, TaskId)>,
    #[serde(default)]
    entry_points: Vec<TaskId>,
    #[serde(default)]
    exit_points: Vec<TaskId>,
}

impl Serialize for TaskDag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        DagRepr {
            nodes: self.nodes().cloned().collect(),
            edges: self.edges(),
            entry_points: self.entry_points(),
            exit_points: self.exit_points(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskDag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = DagRepr::deserialize(deserializer)?;
        TaskDag::from_nodes(repr.nodes).map_err(serde::de::Error::custom)
    }
}
