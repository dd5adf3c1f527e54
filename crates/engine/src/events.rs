//! Task lifecycle events and their fan-out to subscribers.

use cogwheel_core::{PayloadId, PeerId, TaskId};
use cogwheel_mesh::ReportOutcome;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    TaskCreated { task: TaskId },
    TaskReady { task: TaskId, key: f64 },
    /// `peer` is set when the task runs on a remote node.
    TaskStarted { task: TaskId, peer: Option<PeerId> },
    TaskCompleted { task: TaskId, result: PayloadId },
    TaskFailed { task: TaskId, error: String },
    TaskReassigned { task: TaskId, from: PeerId },
    TaskCanceled { task: TaskId },
    /// An aggregate node is waiting for `resolve_synthesis`.
    SynthesisPending { task: TaskId },
    /// A causally later report for a settled task replaced the recorded
    /// one. The graph keeps the result it settled with.
    AuthoritativeReport {
        task: TaskId,
        peer: PeerId,
        outcome: ReportOutcome,
    },
}

impl EngineEvent {
    pub fn task(&self) -> TaskId {
        match self {
            EngineEvent::TaskCreated { task }
            | EngineEvent::TaskReady { task, .. }
            | EngineEvent::TaskStarted { task, .. }
            | EngineEvent::TaskCompleted { task, .. }
            | EngineEvent::TaskFailed { task, .. }
            | EngineEvent::TaskReassigned { task, .. }
            | EngineEvent::TaskCanceled { task }
            | EngineEvent::SynthesisPending { task }
            | EngineEvent::AuthoritativeReport { task, .. } => *task,
        }
    }
}

/// Delivers events in order to every subscriber's bounded channel.
///
/// Publishing never waits: a subscriber whose channel is full misses the
/// event, and a closed subscriber is dropped.
#[derive(Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::Sender<EngineEvent>>,
    dropped: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<EngineEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events lost to full subscriber channels.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn publish(&mut self, event: EngineEvent) {
        let mut dropped = 0;
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if dropped > 0 {
            warn!(task = %event.task(), dropped, "event subscriber full, event dropped");
            self.dropped += dropped;
        }
    }
}
