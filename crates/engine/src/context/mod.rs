//! Scheduler context -- the single owner of graph, queue and mesh state.
//!
//! Every mutation happens here, synchronously, on the engine's actor task.
//! Nothing in the context awaits or performs I/O: side effects are queued as
//! [`Action`]s which the runtime drains after each event.
//!
//! Split into focused submodules:
//! - `core`: context struct, construction, caller-facing operations and queries
//! - `dispatch`: ready-queue maintenance, placement, settlement and worker reports
//! - `mesh`: inbound protocol messages, membership and heartbeats

mod core;
mod dispatch;
mod mesh;

pub use self::core::{Action, SchedulerContext};
