//! Dependency tracking for admitted tasks.
//!
//! The `DependencyTracker` keeps the DAG of dependency and parent/child
//! relationships between tasks, rejects edges that would introduce a cycle,
//! releases dependents when their dependencies complete, and computes the
//! cascade when a task fails or is cancelled.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Kind of edge between two tasks.
///
/// Edges always point from the task that must finish first to the task
/// that waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// The target lists the source in its `dependencies`.
    Dependency,
    /// The source is a fan-out unit of the target logical task.
    Parent,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Dependency => write!(f, "dependency"),
            EdgeKind::Parent => write!(f, "parent"),
        }
    }
}

/// What happens to dependents when a dependency fails or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Every transitive dependent is cancelled.
    #[default]
    Mandatory,
    /// Dependents flagged `failure_tolerant` treat the failure as resolved.
    AllowTolerant,
}

/// Resolution state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
struct TaskNode {
    id: TaskId,
    state: NodeState,
    failure_tolerant: bool,
}

/// Whether an admitted task may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some dependencies have not completed yet.
    Waiting { unmet: usize },
    /// A dependency already failed and the failure cascades to this task.
    Blocked,
}

/// Outcome of propagating a failure or cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cascade {
    /// Dependents cancelled as a consequence, in discovery order.
    pub cancelled: Vec<TaskId>,
    /// Failure-tolerant dependents that became ready.
    pub released: Vec<TaskId>,
}

/// The task dependency graph.
pub struct DependencyTracker {
    graph: StableDiGraph<TaskNode, EdgeKind>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    policy: CascadePolicy,
}

impl DependencyTracker {
    pub fn new(policy: CascadePolicy) -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> CascadePolicy {
        self.policy
    }

    /// Admit a task with its dependencies and optional owning parent.
    ///
    /// All checks run before any mutation, so a rejected admission leaves
    /// the graph untouched.
    ///
    /// # Errors
    /// - `Validation` if the task is already tracked or references an
    ///   unknown dependency or parent.
    /// - `CyclicDependency` if the new edges would close a cycle.
    pub fn admit(
        &mut self,
        id: TaskId,
        dependencies: &[TaskId],
        parent: Option<TaskId>,
        failure_tolerant: bool,
    ) -> Result<Readiness> {
        if self.task_index.contains_key(&id) {
            return Err(Error::Validation(format!("Task {} already tracked", id)));
        }

        let mut dep_indices = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if *dep == id {
                return Err(Error::CyclicDependency { from: id, to: id });
            }
            let index = self
                .task_index
                .get(dep)
                .copied()
                .ok_or_else(|| Error::Validation(format!("Unknown dependency {}", dep)))?;
            dep_indices.push((*dep, index));
        }

        let parent_index = match parent {
            Some(p) => Some(
                self.task_index
                    .get(&p)
                    .copied()
                    .ok_or_else(|| Error::Validation(format!("Unknown parent {}", p)))?,
            ),
            None => None,
        };

        // The new node closes a cycle only through dep -> new -> parent -> ... -> dep.
        if let Some(p_idx) = parent_index {
            for (dep, d_idx) in &dep_indices {
                if has_path_connecting(&self.graph, p_idx, *d_idx, None) {
                    return Err(Error::CyclicDependency {
                        from: *dep,
                        to: id,
                    });
                }
            }
        }

        let index = self.graph.add_node(TaskNode {
            id,
            state: NodeState::Pending,
            failure_tolerant,
        });
        self.task_index.insert(id, index);
        for (_, d_idx) in &dep_indices {
            self.graph.add_edge(*d_idx, index, EdgeKind::Dependency);
        }
        if let Some(p_idx) = parent_index {
            self.graph.add_edge(index, p_idx, EdgeKind::Parent);
        }

        tracing::debug!(
            task_id = %id,
            dependencies = dependencies.len(),
            parent = ?parent,
            "tracked task"
        );
        Ok(self.readiness_of(index))
    }

    /// Add a dependency edge between two tracked tasks.
    ///
    /// `from` must finish before `to` can become ready.
    ///
    /// # Errors
    /// Returns `CyclicDependency` if `to` already reaches `from`, and
    /// `Validation` if either task is unknown or the edge already exists.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<Readiness> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None)
        {
            return Err(Error::CyclicDependency {
                from: *from,
                to: *to,
            });
        }
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Err(Error::Validation(format!(
                "Dependency from {} to {} already exists",
                from, to
            )));
        }

        self.graph.add_edge(from_index, to_index, EdgeKind::Dependency);
        tracing::debug!(from = %from, to = %to, "added dependency edge");
        Ok(self.readiness_of(to_index))
    }

    /// Current readiness of a tracked task.
    pub fn readiness(&self, id: &TaskId) -> Result<Readiness> {
        Ok(self.readiness_of(self.index_of(id)?))
    }

    fn readiness_of(&self, index: NodeIndex) -> Readiness {
        let tolerant = self.tolerates_failure(index);
        let mut unmet = 0;
        for dep in self.dependency_nodes(index) {
            match dep.state {
                NodeState::Completed => {}
                NodeState::Pending => unmet += 1,
                NodeState::Failed | NodeState::Cancelled => {
                    if !tolerant {
                        return Readiness::Blocked;
                    }
                }
            }
        }
        if unmet == 0 {
            Readiness::Ready
        } else {
            Readiness::Waiting { unmet }
        }
    }

    fn tolerates_failure(&self, index: NodeIndex) -> bool {
        self.policy == CascadePolicy::AllowTolerant
            && self
                .graph
                .node_weight(index)
                .map(|n| n.failure_tolerant)
                .unwrap_or(false)
    }

    fn dependency_nodes(&self, index: NodeIndex) -> impl Iterator<Item = &TaskNode> {
        self.graph
            .edges_directed(index, Direction::Incoming)
            .filter(|e| *e.weight() == EdgeKind::Dependency)
            .filter_map(|e| self.graph.node_weight(e.source()))
    }

    /// Dependents of `index` in admission order.
    fn dependent_indices(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .edges_directed(index, Direction::Outgoing)
            .filter(|e| *e.weight() == EdgeKind::Dependency)
            .map(|e| e.target())
            .collect();
        children.sort();
        children
    }

    /// Mark a task completed and return dependents that became ready.
    pub fn complete(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let index = self.index_of(id)?;
        self.set_state(index, NodeState::Completed);

        let released: Vec<TaskId> = self
            .dependent_indices(index)
            .into_iter()
            .filter(|child| self.state_of(*child) == Some(NodeState::Pending))
            .filter(|child| self.readiness_of(*child) == Readiness::Ready)
            .filter_map(|child| self.graph.node_weight(child).map(|n| n.id))
            .collect();

        tracing::debug!(task_id = %id, released = released.len(), "dependency completed");
        Ok(released)
    }

    /// Mark a task failed and cascade to its transitive dependents.
    pub fn fail(&mut self, id: &TaskId) -> Result<Cascade> {
        self.resolve_unsuccessfully(id, NodeState::Failed)
    }

    /// Mark a task cancelled and cascade to its transitive dependents.
    pub fn cancel(&mut self, id: &TaskId) -> Result<Cascade> {
        self.resolve_unsuccessfully(id, NodeState::Cancelled)
    }

    fn resolve_unsuccessfully(&mut self, id: &TaskId, state: NodeState) -> Result<Cascade> {
        let index = self.index_of(id)?;
        if self.state_of(index) == Some(NodeState::Completed) {
            return Ok(Cascade::default());
        }
        self.set_state(index, state);

        let mut cascade = Cascade::default();
        let mut queue = VecDeque::from([index]);
        while let Some(current) = queue.pop_front() {
            for child in self.dependent_indices(current) {
                if self.state_of(child) != Some(NodeState::Pending) {
                    continue;
                }
                if self.tolerates_failure(child) {
                    if self.readiness_of(child) == Readiness::Ready {
                        if let Some(node) = self.graph.node_weight(child) {
                            if !cascade.released.contains(&node.id) {
                                cascade.released.push(node.id);
                            }
                        }
                    }
                    continue;
                }
                self.set_state(child, NodeState::Cancelled);
                if let Some(node) = self.graph.node_weight(child) {
                    cascade.cancelled.push(node.id);
                }
                queue.push_back(child);
            }
        }

        if !cascade.cancelled.is_empty() {
            tracing::debug!(
                task_id = %id,
                cancelled = cascade.cancelled.len(),
                "cascading cancellation"
            );
        }
        Ok(cascade)
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or(Error::TaskNotFound { id: *id })
    }

    fn state_of(&self, index: NodeIndex) -> Option<NodeState> {
        self.graph.node_weight(index).map(|n| n.state)
    }

    fn set_state(&mut self, index: NodeIndex, state: NodeState) {
        if let Some(node) = self.graph.node_weight_mut(index) {
            node.state = state;
        }
    }

    /// Resolution state of a task, if tracked.
    pub fn state(&self, id: &TaskId) -> Option<NodeState> {
        self.task_index.get(id).and_then(|i| self.state_of(*i))
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Tasks `id` depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self.dependency_nodes(index).map(|n| n.id).collect(),
            None => Vec::new(),
        }
    }

    /// Tasks that list `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .dependent_indices(index)
                .into_iter()
                .filter_map(|i| self.graph.node_weight(i).map(|n| n.id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every edge in the graph as `(from, to, kind)`.
    pub fn edges(&self) -> Vec<(TaskId, TaskId, EdgeKind)> {
        self.graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?.id;
                let to = self.graph.node_weight(e.target())?.id;
                Some((from, to, *e.weight()))
            })
            .collect()
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Get tasks in topological order (every task after its dependencies).
    ///
    /// # Errors
    /// Returns `CyclicDependency` if a cycle exists, which admission prevents.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|n| n.id)
                .unwrap_or_default();
            Error::CyclicDependency { from: id, to: id }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index).map(|n| n.id))
            .collect())
    }
}

impl Default for DependencyTracker {
    fn default() -> Self {
        Self::new(CascadePolicy::default())
    }
}

impl std::fmt::Debug for DependencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyTracker")
            .field("tasks", &self.task_count())
            .field("edges", &self.edge_count())
            .field("policy", &self.policy)
            .finish()
    }
}
