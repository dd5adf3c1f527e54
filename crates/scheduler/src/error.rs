use cogwheel_core::TaskId;

use crate::heap::Handle;

/// Errors returned by [`FibonacciHeap`](crate::FibonacciHeap) operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap underflow: heap is empty")]
    Empty,

    #[error("heap underflow: stale handle {0:?}")]
    StaleHandle(Handle),

    #[error("invalid key: {requested} is not less than current key {current}")]
    InvalidKey { current: f64, requested: f64 },
}

impl HeapError {
    /// True for the empty-heap and stale-handle cases.
    pub fn is_underflow(&self) -> bool {
        matches!(self, HeapError::Empty | HeapError::StaleHandle(_))
    }
}

/// Errors returned by the ready queue and priority calculator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("task {0} is already queued")]
    AlreadyQueued(TaskId),

    #[error("task {0} is not queued")]
    NotQueued(TaskId),
}
