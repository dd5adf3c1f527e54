use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::Requirements;
use crate::ids::{PayloadId, PeerId, TaskId};

/// Lifecycle state of a task.
///
/// `Pending → Scheduled → Running → {CompletedSuccess | CompletedFailure | Canceled}`,
/// with `Running → Pending` and `Scheduled → Pending` used when a task is
/// reassigned or its placement is deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    CompletedSuccess,
    CompletedFailure,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::CompletedSuccess | TaskStatus::CompletedFailure | TaskStatus::Canceled
        )
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Pending, Scheduled | Canceled | CompletedFailure) => true,
            (Scheduled, Running | Pending | Canceled | CompletedFailure) => true,
            (Running, CompletedSuccess | CompletedFailure | Canceled | Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::CompletedSuccess => "completed_success",
            TaskStatus::CompletedFailure => "completed_failure",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    /// Caller-assigned priority; lower runs first.
    pub base_priority: f64,
    /// Current heap key.
    pub effective_priority: f64,
    pub status: TaskStatus,
    pub dependency_ids: BTreeSet<TaskId>,
    /// Back-references maintained by the graph. Not ownership.
    pub dependent_ids: BTreeSet<TaskId>,
    pub payload_ref: PayloadId,
    pub requirements: Requirements,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-task override of the executor timeout.
    pub timeout_ms: Option<u64>,
    pub retry_count: u32,
    pub result: Option<PayloadId>,
    pub error: Option<String>,
    pub owner_peer_id: Option<PeerId>,
}

impl TaskNode {
    pub fn new(payload_ref: PayloadId, base_priority: f64) -> Self {
        Self {
            id: TaskId::new(),
            base_priority,
            effective_priority: base_priority,
            status: TaskStatus::Pending,
            dependency_ids: BTreeSet::new(),
            dependent_ids: BTreeSet::new(),
            payload_ref,
            requirements: Requirements::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms: None,
            retry_count: 0,
            result: None,
            error: None,
            owner_peer_id: None,
        }
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Role of a node in a Graph-of-Thought.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Question,
    Decomposition,
    Hypothesis,
    Synthesis,
    Answer,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Question => write!(f, "Question"),
            NodeType::Decomposition => write!(f, "Decomposition"),
            NodeType::Hypothesis => write!(f, "Hypothesis"),
            NodeType::Synthesis => write!(f, "Synthesis"),
            NodeType::Answer => write!(f, "Answer"),
        }
    }
}

/// What a node does when one of its best-effort dependencies did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackPolicy {
    /// Run with the failed input simply absent.
    Proceed,
    /// Run with the given payload standing in for the failed input.
    Substitute(PayloadId),
}

/// A task node with Graph-of-Thought structure on top.
///
/// `parent_ids` / `child_ids` are derivation edges and are independent of
/// the dependency edges held in `task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub task: TaskNode,
    pub node_type: NodeType,
    pub parent_ids: BTreeSet<TaskId>,
    pub child_ids: BTreeSet<TaskId>,
    /// Overrides the graph-wide best-effort fallback.
    pub fallback: Option<FallbackPolicy>,
}

impl GraphNode {
    pub fn new(node_type: NodeType, task: TaskNode) -> Self {
        Self {
            task,
            node_type,
            parent_ids: BTreeSet::new(),
            child_ids: BTreeSet::new(),
            fallback: None,
        }
    }

    pub fn question(payload_ref: PayloadId, base_priority: f64) -> Self {
        Self::new(NodeType::Question, TaskNode::new(payload_ref, base_priority))
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }

    /// Nodes with structural children are resolved by synthesis, not execution.
    pub fn is_aggregate(&self) -> bool {
        !self.child_ids.is_empty()
    }
}
