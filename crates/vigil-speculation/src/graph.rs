//! In-memory DAG of task dependencies with topological-depth tracking.
//!
//! Edge insertion checks reachability before linking, so the graph can
//! never hold a cycle; depth is recomputed transitively on every new edge.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use vigil_types::{DependencyType, TaskPda};

use crate::SpeculationError;

/// Execution state of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExecutionState {
    /// Registered, not yet running.
    Pending,
    /// Currently executing (possibly speculatively).
    Executing,
    /// Finished successfully.
    Completed,
    /// Failed.
    Failed,
    /// Undone by a cascade rollback.
    RolledBack,
}

/// One task in the dependency DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyNode {
    /// Task this node represents.
    pub task_pda: TaskPda,
    /// Current execution state.
    pub status: TaskExecutionState,
    /// Direct prerequisites.
    pub parents: BTreeSet<TaskPda>,
    /// Tasks that depend on this one.
    pub children: BTreeSet<TaskPda>,
    /// 0 for roots, `1 + max(parent depth)` otherwise.
    pub depth: u32,
    /// How this node depends on each parent.
    pub dependency_types: BTreeMap<TaskPda, DependencyType>,
}

impl DependencyNode {
    fn new(task_pda: TaskPda) -> Self {
        Self {
            task_pda,
            status: TaskExecutionState::Pending,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            depth: 0,
            dependency_types: BTreeMap::new(),
        }
    }
}

/// Dependency DAG keyed by task address.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<TaskPda, DependencyNode>,
}

impl DependencyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with no dependencies. Idempotent.
    pub fn add_task(&mut self, task: TaskPda) {
        self.nodes.entry(task.clone()).or_insert_with(|| DependencyNode::new(task));
    }

    /// Register `child` as depending on `parent`.
    ///
    /// Fails with [`SpeculationError::DependencyCycle`] when the edge would
    /// make `parent` reachable from itself. Depths of the child and all its
    /// descendants are recomputed transitively.
    pub fn add_task_with_parent(
        &mut self,
        child: TaskPda,
        parent: TaskPda,
        dependency: DependencyType,
    ) -> Result<(), SpeculationError> {
        if child == parent {
            return Err(SpeculationError::DependencyCycle {
                child: child.0,
                parent: parent.0,
            });
        }
        self.add_task(child.clone());
        self.add_task(parent.clone());

        // The edge parent -> child closes a cycle iff parent is already
        // reachable from child.
        if self.is_reachable(&child, &parent) {
            return Err(SpeculationError::DependencyCycle {
                child: child.0,
                parent: parent.0,
            });
        }

        if let Some(node) = self.nodes.get_mut(&parent) {
            node.children.insert(child.clone());
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.insert(parent.clone());
            node.dependency_types.insert(parent, dependency);
        }
        self.recompute_depths_from(&child);
        Ok(())
    }

    /// Update a node's execution state.
    pub fn update_status(
        &mut self,
        task: &TaskPda,
        status: TaskExecutionState,
    ) -> Result<(), SpeculationError> {
        let node = self
            .nodes
            .get_mut(task)
            .ok_or_else(|| SpeculationError::UnknownTask(task.0.clone()))?;
        node.status = status;
        Ok(())
    }

    /// Topological depth of a task, when registered.
    pub fn depth(&self, task: &TaskPda) -> Option<u32> {
        self.nodes.get(task).map(|n| n.depth)
    }

    /// Look up a node.
    pub fn node(&self, task: &TaskPda) -> Option<&DependencyNode> {
        self.nodes.get(task)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pending nodes whose parents are all `Executing` or `Completed`.
    ///
    /// Returned in task-address order for determinism.
    pub fn speculatable_tasks(&self) -> Vec<&DependencyNode> {
        let mut out: Vec<&DependencyNode> = self
            .nodes
            .values()
            .filter(|node| {
                node.status == TaskExecutionState::Pending
                    && node.parents.iter().all(|parent| {
                        matches!(
                            self.nodes.get(parent).map(|p| p.status),
                            Some(TaskExecutionState::Executing)
                                | Some(TaskExecutionState::Completed)
                        )
                    })
            })
            .collect();
        out.sort_by(|a, b| a.task_pda.cmp(&b.task_pda));
        out
    }

    /// Every descendant of `task`, breadth-first.
    pub fn descendants(&self, task: &TaskPda) -> Vec<TaskPda> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<TaskPda> = VecDeque::new();
        if let Some(node) = self.nodes.get(task) {
            queue.extend(node.children.iter().cloned());
        }
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&next) {
                queue.extend(node.children.iter().cloned());
            }
            out.push(next);
        }
        out
    }

    fn is_reachable(&self, from: &TaskPda, target: &TaskPda) -> bool {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&TaskPda> = VecDeque::new();
        queue.push_back(from);
        while let Some(next) = queue.pop_front() {
            if next == target {
                return true;
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(next) {
                queue.extend(node.children.iter());
            }
        }
        false
    }

    fn recompute_depths_from(&mut self, start: &TaskPda) {
        let mut queue: VecDeque<TaskPda> = VecDeque::new();
        queue.push_back(start.clone());
        while let Some(task) = queue.pop_front() {
            let new_depth = {
                let Some(node) = self.nodes.get(&task) else {
                    continue;
                };
                node.parents
                    .iter()
                    .filter_map(|p| self.nodes.get(p).map(|n| n.depth))
                    .max()
                    .map(|d| d + 1)
                    .unwrap_or(0)
            };
            let Some(node) = self.nodes.get_mut(&task) else {
                continue;
            };
            if node.depth != new_depth || task == *start {
                node.depth = new_depth;
                queue.extend(node.children.iter().cloned());
            }
        }
    }
}
