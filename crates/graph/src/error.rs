use cogwheel_core::{NodeType, TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("cycle detected: edge {from} -> {to} would close a cycle")]
    CycleDetected { from: TaskId, to: TaskId },

    #[error("dependency not found: {0}")]
    DependencyNotFound(TaskId),

    #[error("node {0} already exists")]
    DuplicateNode(TaskId),

    #[error("edge {from} -> {to} already exists")]
    DuplicateEdge { from: TaskId, to: TaskId },

    #[error("task {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} has unsettled dependencies")]
    NotReady(TaskId),

    #[error("task {id} is {status}, expected pending")]
    NotPending { id: TaskId, status: TaskStatus },

    #[error("no decomposition strategy registered for {0}")]
    NoStrategy(NodeType),
}
