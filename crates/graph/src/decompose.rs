//! Decomposition strategies: split a node into structural children.

use std::collections::HashMap;

use cogwheel_core::{GraphNode, NodeType, TaskId, TaskNode, TaskStatus};
use tracing::info;

use crate::dag::{DependencyGraph, EdgeType};
use crate::error::GraphError;

/// Produces the children of a node. The graph wires the edges.
pub trait DecompositionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn decompose(&self, parent: &GraphNode) -> Vec<GraphNode>;
}

/// Split into `fan_out` children of one type, each carrying the parent's
/// payload, priority and requirements.
#[derive(Debug, Clone)]
pub struct FixedFanOut {
    pub fan_out: usize,
    pub child_type: NodeType,
}

impl FixedFanOut {
    pub fn new(fan_out: usize, child_type: NodeType) -> Self {
        Self { fan_out, child_type }
    }
}

impl DecompositionStrategy for FixedFanOut {
    fn name(&self) -> &str {
        "fixed_fan_out"
    }

    fn decompose(&self, parent: &GraphNode) -> Vec<GraphNode> {
        (0..self.fan_out)
            .map(|_| {
                let mut task =
                    TaskNode::new(parent.task.payload_ref.clone(), parent.task.base_priority)
                        .with_requirements(parent.task.requirements.clone());
                task.timeout_ms = parent.task.timeout_ms;
                let mut child = GraphNode::new(self.child_type, task);
                child.fallback = parent.fallback.clone();
                child
            })
            .collect()
    }
}

/// Strategies selected by the type of the node being decomposed.
#[derive(Default)]
pub struct DecompositionRegistry {
    strategies: HashMap<NodeType, Box<dyn DecompositionStrategy>>,
}

impl DecompositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed fan-out into hypotheses for questions and decomposition nodes.
    pub fn with_defaults(fan_out: usize) -> Self {
        let mut registry = Self::new();
        registry.register(
            NodeType::Question,
            FixedFanOut::new(fan_out, NodeType::Hypothesis),
        );
        registry.register(
            NodeType::Decomposition,
            FixedFanOut::new(fan_out, NodeType::Hypothesis),
        );
        registry
    }

    pub fn register(&mut self, node_type: NodeType, strategy: impl DecompositionStrategy + 'static) {
        self.strategies.insert(node_type, Box::new(strategy));
    }

    pub fn get(&self, node_type: NodeType) -> Option<&dyn DecompositionStrategy> {
        self.strategies.get(&node_type).map(|s| s.as_ref())
    }
}

impl DependencyGraph {
    /// Split a pending node into children using the strategy registered for
    /// its type.
    ///
    /// Each child inherits the parent's dependencies, is linked by a
    /// `Derives` edge from the parent, and feeds the parent through a
    /// `BestEffort` edge, so the parent becomes ready once every child is
    /// terminal.
    pub fn decompose(
        &mut self,
        parent_id: &TaskId,
        registry: &DecompositionRegistry,
    ) -> Result<Vec<TaskId>, GraphError> {
        let parent = self
            .get(parent_id)
            .ok_or(GraphError::DependencyNotFound(*parent_id))?;
        if parent.status() != TaskStatus::Pending {
            return Err(GraphError::NotPending {
                id: *parent_id,
                status: parent.status(),
            });
        }
        let strategy = registry
            .get(parent.node_type)
            .ok_or(GraphError::NoStrategy(parent.node_type))?;

        let inherited: Vec<(TaskId, EdgeType)> = parent
            .task
            .dependency_ids
            .iter()
            .filter_map(|dep| self.edge(dep, parent_id).map(|e| (*dep, e.edge_type)))
            .collect();
        let children = strategy.decompose(parent);
        let name = strategy.name().to_string();

        let mut ids = Vec::with_capacity(children.len());
        for mut child in children {
            child.task.dependency_ids.clear();
            let child_id = self.add_node(child)?;
            for (dep, edge_type) in &inherited {
                self.add_edge(*dep, child_id, *edge_type, 1.0)?;
            }
            self.add_edge(*parent_id, child_id, EdgeType::Derives, 1.0)?;
            self.add_edge(child_id, *parent_id, EdgeType::BestEffort, 1.0)?;
            ids.push(child_id);
        }
        info!(task = %parent_id, strategy = %name, children = ids.len(), "decomposed");
        Ok(ids)
    }
}
