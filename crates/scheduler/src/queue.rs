//! Ready queue: a [`FibonacciHeap`] of task ids plus the id → handle index
//! that keeps each task in at most one heap node.

use std::collections::HashMap;

use cogwheel_core::TaskId;
use tracing::trace;

use crate::error::{HeapError, SchedulerError};
use crate::heap::{FibonacciHeap, Handle};

#[derive(Default)]
pub struct ReadyQueue {
    heap: FibonacciHeap<TaskId>,
    handles: HashMap<TaskId, Handle>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn push(&mut self, id: TaskId, key: f64) -> Result<(), SchedulerError> {
        if self.handles.contains_key(&id) {
            return Err(SchedulerError::AlreadyQueued(id));
        }
        let handle = self.heap.insert(key, id);
        self.handles.insert(id, handle);
        trace!(task = %id, key, "queued");
        Ok(())
    }

    /// Remove and return the lowest-key task.
    pub fn pop(&mut self) -> Option<(TaskId, f64)> {
        match self.heap.extract_min() {
            Ok((key, id)) => {
                self.handles.remove(&id);
                Some((id, key))
            }
            Err(HeapError::Empty) => None,
            Err(e) => panic!("scheduler invariant violated: ready queue extract failed: {e}"),
        }
    }

    pub fn peek(&self) -> Option<(TaskId, f64)> {
        self.heap.peek_min_entry().map(|(key, id)| (*id, key))
    }

    pub fn key_of(&self, id: &TaskId) -> Option<f64> {
        let handle = self.handles.get(id)?;
        self.heap.key(*handle).ok()
    }

    pub fn remove(&mut self, id: &TaskId) -> Result<f64, SchedulerError> {
        let handle = self
            .handles
            .remove(id)
            .ok_or(SchedulerError::NotQueued(*id))?;
        let (key, _) = self.heap.delete(handle)?;
        Ok(key)
    }

    /// Strictly lower a queued task's key.
    pub fn lower_key(&mut self, id: &TaskId, key: f64) -> Result<(), SchedulerError> {
        let handle = *self.handles.get(id).ok_or(SchedulerError::NotQueued(*id))?;
        self.heap.decrease_key(handle, key)?;
        Ok(())
    }

    /// Set a queued task's key to any value. Increases go through
    /// delete + reinsert, which also resets the task's tie-break position.
    pub fn rekey(&mut self, id: &TaskId, key: f64) -> Result<(), SchedulerError> {
        let current = self.key_of(id).ok_or(SchedulerError::NotQueued(*id))?;
        if key < current {
            return self.lower_key(id, key);
        }
        if key == current {
            return Ok(());
        }
        self.remove(id)?;
        self.push(*id, key)
    }

    /// Queued ids in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.handles.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_key_order() {
        let mut q = ReadyQueue::new();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());
        q.push(a, 3.0).unwrap();
        q.push(b, 1.0).unwrap();
        q.push(c, 2.0).unwrap();

        assert_eq!(q.peek(), Some((b, 1.0)));
        assert_eq!(q.pop(), Some((b, 1.0)));
        assert_eq!(q.pop(), Some((c, 2.0)));
        assert_eq!(q.pop(), Some((a, 3.0)));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn task_occupies_one_node() {
        let mut q = ReadyQueue::new();
        let a = TaskId::new();
        q.push(a, 1.0).unwrap();
        assert_eq!(q.push(a, 0.5), Err(SchedulerError::AlreadyQueued(a)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn lower_and_rekey() {
        let mut q = ReadyQueue::new();
        let (a, b) = (TaskId::new(), TaskId::new());
        q.push(a, 5.0).unwrap();
        q.push(b, 3.0).unwrap();

        assert!(matches!(
            q.lower_key(&a, 6.0),
            Err(SchedulerError::Heap(HeapError::InvalidKey { .. }))
        ));
        q.lower_key(&a, 1.0).unwrap();
        assert_eq!(q.peek().map(|(id, _)| id), Some(a));

        q.rekey(&a, 10.0).unwrap();
        assert_eq!(q.key_of(&a), Some(10.0));
        assert_eq!(q.pop().map(|(id, _)| id), Some(b));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_unknown_task() {
        let mut q = ReadyQueue::new();
        let a = TaskId::new();
        assert_eq!(q.remove(&a), Err(SchedulerError::NotQueued(a)));
        q.push(a, 2.0).unwrap();
        assert_eq!(q.remove(&a), Ok(2.0));
        assert!(!q.contains(&a));
    }
}
