use cogwheel_core::{ConfigError, StorageError, TaskId};
use cogwheel_graph::GraphError;
use cogwheel_mesh::MeshError;
use cogwheel_scheduler::SchedulerError;
use thiserror::Error;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("payload resolution failed: {0}")]
    PayloadResolution(#[from] StorageError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("task {task} timed out after {timeout_ms}ms")]
    TaskTimeout { task: TaskId, timeout_ms: u64 },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {0} is not awaiting synthesis")]
    NotHeld(TaskId),

    #[error("engine has shut down")]
    Shutdown,
}
