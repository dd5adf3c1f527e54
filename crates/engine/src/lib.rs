//! Single-writer scheduling engine: ties the dependency graph, the priority
//! queue, the local worker pool and the delegation mesh together behind an
//! async handle.

pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod runtime;

pub use context::{Action, SchedulerContext};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus};
pub use executor::{
    CancelFlag, EchoRunner, Job, JobHandle, RunContext, RunError, TaskRunner, WorkerPool,
    WorkerReport,
};
pub use runtime::{Engine, EngineBuilder, EngineHandle, DEFAULT_BASE_PRIORITY};
