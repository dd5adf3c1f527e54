//! The dependency graph: cycle-checked edges, incremental readiness and
//! failure propagation.
//!
//! An edge `from -> to` means `to` depends on `from` (for dependency edges)
//! or that `to` was derived from `from` (for structural edges). Dependency
//! and structural edges are checked for cycles independently, so a parent
//! may both derive its children and wait on them.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cogwheel_core::{FallbackPolicy, GraphNode, PayloadId, PeerId, TaskId, TaskStatus};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GraphError;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    /// `to` runs only after `from` succeeds; failure of `from` fails `to`.
    Requires,
    /// `to` runs once `from` is terminal, whatever the outcome.
    BestEffort,
    /// Structural: `to` was derived from `from`. No scheduling effect.
    Derives,
}

impl EdgeType {
    pub fn is_dependency(&self) -> bool {
        !matches!(self, EdgeType::Derives)
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeType::Requires => write!(f, "requires"),
            EdgeType::BestEffort => write!(f, "best_effort"),
            EdgeType::Derives => write!(f, "derives"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub from: TaskId,
    pub to: TaskId,
    pub edge_type: EdgeType,
    pub weight: f64,
}

/// What a node receives for one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyInput {
    Ready(PayloadId),
    Missing,
    Substituted(PayloadId),
}

/// Side effects of a terminal transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settled {
    /// Dependents that became ready, in discovery order.
    pub ready: Vec<TaskId>,
    /// Dependents failed by propagation, in discovery order.
    pub failed: Vec<TaskId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeClass {
    Dependency,
    Structural,
}

impl From<EdgeType> for EdgeClass {
    fn from(t: EdgeType) -> Self {
        if t.is_dependency() {
            EdgeClass::Dependency
        } else {
            EdgeClass::Structural
        }
    }
}

pub struct DependencyGraph {
    nodes: IndexMap<TaskId, GraphNode>,
    edges: HashMap<(TaskId, TaskId), Edge>,
    outgoing: HashMap<TaskId, BTreeSet<TaskId>>,
    incoming: HashMap<TaskId, BTreeSet<TaskId>>,
    /// Pending nodes whose dependencies are all settled.
    ready: IndexSet<TaskId>,
    fallback: FallbackPolicy,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new(FallbackPolicy::Proceed)
    }
}

impl DependencyGraph {
    /// `fallback` applies to nodes that do not set their own.
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self {
            nodes: IndexMap::new(),
            edges: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            ready: IndexSet::new(),
            fallback,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn get(&self, id: &TaskId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.nodes.get(id).map(|n| n.status())
    }

    pub fn edge(&self, from: &TaskId, to: &TaskId) -> Option<&Edge> {
        self.edges.get(&(*from, *to))
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn is_ready(&self, id: &TaskId) -> bool {
        self.ready.contains(id)
    }

    /// Pending nodes whose dependencies are all satisfied, oldest first.
    pub fn get_ready_nodes(&self) -> Vec<TaskId> {
        self.ready.iter().copied().collect()
    }

    /// Insert a node. Ids already listed in `task.dependency_ids` are wired
    /// as `Requires` edges; back-references and structural links are owned
    /// by the graph and rebuilt from edges.
    pub fn add_node(&mut self, mut node: GraphNode) -> Result<TaskId, GraphError> {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        if node.task.status != TaskStatus::Pending {
            return Err(GraphError::NotPending {
                id,
                status: node.task.status,
            });
        }
        if let Some(missing) = node
            .task
            .dependency_ids
            .iter()
            .find(|dep| !self.nodes.contains_key(*dep))
        {
            return Err(GraphError::DependencyNotFound(*missing));
        }

        let deps = std::mem::take(&mut node.task.dependency_ids);
        node.task.dependent_ids.clear();
        node.parent_ids.clear();
        node.child_ids.clear();
        self.nodes.insert(id, node);
        debug!(task = %id, "node added");

        // A brand-new node has no outgoing edges, so none of these can cycle.
        for dep in deps {
            self.commit_edge(dep, id, EdgeType::Requires, 1.0);
        }
        self.settle_new_dependency(id);
        Ok(id)
    }

    /// Validate and commit an edge. On error the graph is unchanged.
    pub fn add_edge(
        &mut self,
        from: TaskId,
        to: TaskId,
        edge_type: EdgeType,
        weight: f64,
    ) -> Result<(), GraphError> {
        for id in [from, to] {
            if !self.nodes.contains_key(&id) {
                return Err(GraphError::DependencyNotFound(id));
            }
        }
        if self.edges.contains_key(&(from, to)) {
            return Err(GraphError::DuplicateEdge { from, to });
        }
        if edge_type.is_dependency() {
            let status = self.nodes[&to].status();
            if status != TaskStatus::Pending {
                return Err(GraphError::NotPending { id: to, status });
            }
        }
        if self.reaches(to, from, edge_type.into()) {
            return Err(GraphError::CycleDetected { from, to });
        }

        self.commit_edge(from, to, edge_type, weight);
        if edge_type.is_dependency() {
            self.settle_new_dependency(to);
        }
        Ok(())
    }

    /// `Pending -> Scheduled`. Only ready nodes may be scheduled.
    pub fn mark_scheduled(&mut self, id: &TaskId) -> Result<(), GraphError> {
        self.check_transition(id, TaskStatus::Scheduled)?;
        if !self.ready.contains(id) {
            return Err(GraphError::NotReady(*id));
        }
        self.ready.shift_remove(id);
        self.node_mut(id).task.status = TaskStatus::Scheduled;
        debug!(task = %id, "scheduled");
        Ok(())
    }

    /// `Scheduled -> Running`.
    pub fn mark_running(&mut self, id: &TaskId) -> Result<(), GraphError> {
        self.check_transition(id, TaskStatus::Running)?;
        let task = &mut self.node_mut(id).task;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        debug!(task = %id, "running");
        Ok(())
    }

    /// Record success and release dependents.
    pub fn mark_complete(&mut self, id: &TaskId, result: PayloadId) -> Result<Settled, GraphError> {
        self.check_transition(id, TaskStatus::CompletedSuccess)?;
        let task = &mut self.node_mut(id).task;
        task.status = TaskStatus::CompletedSuccess;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        task.error = None;
        debug!(task = %id, "completed");

        let mut settled = Settled::default();
        self.release_dependents(id, &mut settled);
        Ok(settled)
    }

    /// Record failure and propagate it to `Requires` dependents, transitively.
    pub fn mark_failed(&mut self, id: &TaskId, error: impl Into<String>) -> Result<Settled, GraphError> {
        self.check_transition(id, TaskStatus::CompletedFailure)?;
        let error = error.into();
        warn!(task = %id, %error, "task failed");
        self.finish_unsuccessful(id, TaskStatus::CompletedFailure, Some(error));
        Ok(self.propagate_failure(*id))
    }

    /// Cancel a non-terminal node. `Requires` dependents fail as if it had.
    pub fn mark_canceled(&mut self, id: &TaskId) -> Result<Settled, GraphError> {
        self.check_transition(id, TaskStatus::Canceled)?;
        debug!(task = %id, "canceled");
        self.finish_unsuccessful(id, TaskStatus::Canceled, None);
        Ok(self.propagate_failure(*id))
    }

    /// Return a scheduled or running node to `Pending` (reassignment or
    /// deferred placement). Returns whether it is ready again.
    pub fn reset_to_pending(&mut self, id: &TaskId) -> Result<bool, GraphError> {
        self.check_transition(id, TaskStatus::Pending)?;
        let task = &mut self.node_mut(id).task;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.owner_peer_id = None;
        let ready = self.refresh_readiness(id);
        debug!(task = %id, ready, "reset to pending");
        Ok(ready)
    }

    pub fn set_effective_priority(&mut self, id: &TaskId, key: f64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.task.effective_priority = key;
        }
    }

    pub fn set_owner(&mut self, id: &TaskId, peer: Option<PeerId>) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.task.owner_peer_id = peer;
        }
    }

    pub fn record_retry(&mut self, id: &TaskId) -> u32 {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.task.retry_count += 1;
                node.task.retry_count
            }
            None => 0,
        }
    }

    /// Number of dependencies that completed successfully.
    pub fn completed_dependencies(&self, id: &TaskId) -> usize {
        self.nodes
            .get(id)
            .map(|n| {
                n.task
                    .dependency_ids
                    .iter()
                    .filter(|d| self.status(d) == Some(TaskStatus::CompletedSuccess))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Resolve each dependency of `id` to the input it should run with,
    /// applying the best-effort fallback policy.
    pub fn inputs(&self, id: &TaskId) -> Result<Vec<(TaskId, DependencyInput)>, GraphError> {
        let node = self
            .nodes
            .get(id)
            .ok_or(GraphError::DependencyNotFound(*id))?;
        let policy = node.fallback.as_ref().unwrap_or(&self.fallback);

        let inputs = node
            .task
            .dependency_ids
            .iter()
            .map(|dep| {
                let dep_node = self.node(dep);
                let input = match (&dep_node.task.result, dep_node.status()) {
                    (Some(result), TaskStatus::CompletedSuccess) => {
                        DependencyInput::Ready(result.clone())
                    }
                    _ if self.edge_type(dep, id) == Some(EdgeType::BestEffort) => match policy {
                        FallbackPolicy::Proceed => DependencyInput::Missing,
                        FallbackPolicy::Substitute(p) => DependencyInput::Substituted(p.clone()),
                    },
                    _ => DependencyInput::Missing,
                };
                (*dep, input)
            })
            .collect();
        Ok(inputs)
    }

    /// Structural children of `id`.
    pub fn children(&self, id: &TaskId) -> Vec<&GraphNode> {
        self.nodes
            .get(id)
            .map(|n| n.child_ids.iter().map(|c| self.node(c)).collect())
            .unwrap_or_default()
    }

    /// Remove terminal nodes that finished more than `retention` before `now`
    /// and have no non-terminal dependents or parents.
    pub fn collect_garbage(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<TaskId> {
        let expired: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.status().is_terminal())
            .filter(|n| {
                n.task
                    .completed_at
                    .and_then(|done| (now - done).to_std().ok())
                    .is_some_and(|elapsed| elapsed >= retention)
            })
            .filter(|n| {
                n.task
                    .dependent_ids
                    .iter()
                    .chain(n.parent_ids.iter())
                    .all(|other| self.status(other).map_or(true, |s| s.is_terminal()))
            })
            .map(|n| n.id())
            .collect();

        for id in &expired {
            self.remove_node(id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), remaining = self.nodes.len(), "graph gc");
        }
        expired
    }

    /// Kahn's algorithm over dependency edges. Ties keep insertion order.
    pub fn topological_order(&self) -> Vec<TaskId> {
        let mut in_degree: IndexMap<TaskId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id(), n.task.dependency_ids.len()))
            .collect();

        let mut queue: VecDeque<TaskId> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            sorted.push(id);
            for next in &self.node(&id).task.dependent_ids {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            panic!("scheduler invariant violated: dependency edges contain a cycle");
        }
        sorted
    }

    // ── Internals ─────────────────────────────────────────────

    fn node(&self, id: &TaskId) -> &GraphNode {
        match self.nodes.get(id) {
            Some(n) => n,
            None => panic!("scheduler invariant violated: edge references missing node {id}"),
        }
    }

    fn node_mut(&mut self, id: &TaskId) -> &mut GraphNode {
        match self.nodes.get_mut(id) {
            Some(n) => n,
            None => panic!("scheduler invariant violated: edge references missing node {id}"),
        }
    }

    fn edge_type(&self, from: &TaskId, to: &TaskId) -> Option<EdgeType> {
        self.edges.get(&(*from, *to)).map(|e| e.edge_type)
    }

    fn check_transition(&self, id: &TaskId, to: TaskStatus) -> Result<(), GraphError> {
        let from = self
            .nodes
            .get(id)
            .ok_or(GraphError::DependencyNotFound(*id))?
            .status();
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(GraphError::InvalidTransition { id: *id, from, to })
        }
    }

    /// Depth-first search from `start` along edges of `class`.
    fn reaches(&self, start: TaskId, goal: TaskId, class: EdgeClass) -> bool {
        if start == goal {
            return true;
        }
        let mut stack = vec![start];
        let mut visited = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            for next in self.outgoing.get(&id).into_iter().flatten() {
                if EdgeClass::from(self.edges[&(id, *next)].edge_type) != class {
                    continue;
                }
                if *next == goal {
                    return true;
                }
                stack.push(*next);
            }
        }
        false
    }

    fn commit_edge(&mut self, from: TaskId, to: TaskId, edge_type: EdgeType, weight: f64) {
        self.edges.insert(
            (from, to),
            Edge {
                from,
                to,
                edge_type,
                weight,
            },
        );
        self.outgoing.entry(from).or_default().insert(to);
        self.incoming.entry(to).or_default().insert(from);
        if edge_type.is_dependency() {
            self.node_mut(&from).task.dependent_ids.insert(to);
            self.node_mut(&to).task.dependency_ids.insert(from);
        } else {
            self.node_mut(&from).child_ids.insert(to);
            self.node_mut(&to).parent_ids.insert(from);
        }
    }

    fn dependency_satisfied(&self, dep: &TaskId, id: &TaskId) -> bool {
        let status = self.node(dep).status();
        match self.edge_type(dep, id) {
            Some(EdgeType::BestEffort) => status.is_terminal(),
            _ => status == TaskStatus::CompletedSuccess,
        }
    }

    fn dependency_doomed(&self, dep: &TaskId, id: &TaskId) -> bool {
        let status = self.node(dep).status();
        self.edge_type(dep, id) == Some(EdgeType::Requires)
            && matches!(status, TaskStatus::CompletedFailure | TaskStatus::Canceled)
    }

    /// Recompute ready-set membership of one node. Returns membership.
    fn refresh_readiness(&mut self, id: &TaskId) -> bool {
        let node = self.node(id);
        let ready = node.status() == TaskStatus::Pending
            && node
                .task
                .dependency_ids
                .iter()
                .all(|dep| self.dependency_satisfied(dep, id));
        if ready {
            self.ready.insert(*id);
        } else {
            self.ready.shift_remove(id);
        }
        ready
    }

    /// After `id` gained a dependency: fail it if the dependency already
    /// failed, otherwise recompute readiness.
    fn settle_new_dependency(&mut self, id: TaskId) {
        let doomed = self
            .node(&id)
            .task
            .dependency_ids
            .iter()
            .find(|dep| self.dependency_doomed(dep, &id))
            .copied();
        match doomed {
            Some(dep) => {
                self.finish_unsuccessful(
                    &id,
                    TaskStatus::CompletedFailure,
                    Some(format!("dependency {dep} did not succeed")),
                );
                self.propagate_failure(id);
            }
            None => {
                self.refresh_readiness(&id);
            }
        }
    }

    fn finish_unsuccessful(&mut self, id: &TaskId, status: TaskStatus, error: Option<String>) {
        self.ready.shift_remove(id);
        let task = &mut self.node_mut(id).task;
        task.status = status;
        task.completed_at = Some(Utc::now());
        task.result = None;
        task.error = error;
    }

    /// Walk dependents of a settled node and admit the ones now ready.
    fn release_dependents(&mut self, id: &TaskId, settled: &mut Settled) {
        let dependents: Vec<TaskId> = self.node(id).task.dependent_ids.iter().copied().collect();
        for dependent in dependents {
            if self.node(&dependent).status() != TaskStatus::Pending
                || self.ready.contains(&dependent)
            {
                continue;
            }
            if self.refresh_readiness(&dependent) {
                settled.ready.push(dependent);
            }
        }
    }

    /// Breadth-first failure propagation from an unsuccessful node.
    fn propagate_failure(&mut self, origin: TaskId) -> Settled {
        let mut settled = Settled::default();
        let mut queue = VecDeque::from([origin]);

        while let Some(id) = queue.pop_front() {
            let dependents: Vec<TaskId> =
                self.node(&id).task.dependent_ids.iter().copied().collect();
            for dependent in dependents {
                if self.node(&dependent).status().is_terminal() {
                    continue;
                }
                match self.edge_type(&id, &dependent) {
                    Some(EdgeType::Requires) => {
                        self.finish_unsuccessful(
                            &dependent,
                            TaskStatus::CompletedFailure,
                            Some(format!("dependency {id} did not succeed")),
                        );
                        debug!(task = %dependent, cause = %id, "failure propagated");
                        settled.failed.push(dependent);
                        queue.push_back(dependent);
                    }
                    _ => {
                        if !self.ready.contains(&dependent) && self.refresh_readiness(&dependent) {
                            settled.ready.push(dependent);
                        }
                    }
                }
            }
        }
        // A node can be admitted by one branch and failed by a later one.
        settled.ready.retain(|id| self.ready.contains(id));
        settled
    }

    fn remove_node(&mut self, id: &TaskId) {
        for next in self.outgoing.remove(id).unwrap_or_default() {
            self.edges.remove(&(*id, next));
            if let Some(set) = self.incoming.get_mut(&next) {
                set.remove(id);
            }
            if let Some(node) = self.nodes.get_mut(&next) {
                node.task.dependency_ids.remove(id);
                node.parent_ids.remove(id);
            }
        }
        for prev in self.incoming.remove(id).unwrap_or_default() {
            self.edges.remove(&(prev, *id));
            if let Some(set) = self.outgoing.get_mut(&prev) {
                set.remove(id);
            }
            if let Some(node) = self.nodes.get_mut(&prev) {
                node.task.dependent_ids.remove(id);
                node.child_ids.remove(id);
            }
        }
        self.ready.shift_remove(id);
        self.nodes.shift_remove(id);
    }
}
