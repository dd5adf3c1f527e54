//! Priority scheduling primitives: an arena-backed Fibonacci heap, the ready
//! queue built on it, and the effective-priority calculator.

pub mod error;
pub mod heap;
pub mod metrics;
pub mod priority;
pub mod queue;

pub use error::{HeapError, SchedulerError};
pub use heap::{FibonacciHeap, Handle, Rebase};
pub use metrics::SchedulerMetrics;
pub use priority::{
    KeyUpdate, PriorityCalculator, PriorityInputs, PriorityStrategy, PriorityWeights,
    RecomputeTrigger,
};
pub use queue::ReadyQueue;
