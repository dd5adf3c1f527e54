//! Delegation protocol payloads.
//!
//! `propose -> accept | reject -> assign -> heartbeat* -> result | failure`,
//! with `cancel` as an out-of-band control message from the owner.

use cogwheel_core::{Capabilities, PayloadId, Requirements, TaskId};
use serde::{Deserialize, Serialize};

/// Topic constants. Pattern: `cogwheel.<domain>.<event>`.
pub mod topics {
    pub const PROPOSE: &str = "cogwheel.task.propose";
    pub const ACCEPT: &str = "cogwheel.task.accept";
    pub const REJECT: &str = "cogwheel.task.reject";
    pub const ASSIGN: &str = "cogwheel.task.assign";
    pub const HEARTBEAT: &str = "cogwheel.task.heartbeat";
    pub const RESULT: &str = "cogwheel.task.result";
    pub const FAILURE: &str = "cogwheel.task.failure";
    pub const CANCEL: &str = "cogwheel.task.cancel";

    /// Capability advertisement, broadcast on connect and on change.
    pub const CAPABILITIES: &str = "cogwheel.peer.capabilities";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub task_id: TaskId,
    pub requirements: Requirements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reject {
    pub task_id: TaskId,
    pub reason: String,
}

/// Everything the assignee needs to run the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assign {
    pub task_id: TaskId,
    pub payload_ref: PayloadId,
    /// Resolved dependency inputs, in dependency order.
    pub inputs: Vec<PayloadId>,
    pub timeout_ms: Option<u64>,
}

/// Tasks the sender is still working on for the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub result: PayloadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAdvert {
    pub capabilities: Capabilities,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_namespaced() {
        for t in [
            topics::PROPOSE,
            topics::ACCEPT,
            topics::REJECT,
            topics::ASSIGN,
            topics::HEARTBEAT,
            topics::RESULT,
            topics::FAILURE,
            topics::CANCEL,
            topics::CAPABILITIES,
        ] {
            assert!(t.starts_with("cogwheel."), "{t}");
        }
    }

    #[test]
    fn assign_survives_msgpack() {
        let assign = Assign {
            task_id: TaskId::new(),
            payload_ref: PayloadId::from("payload"),
            inputs: vec![PayloadId::from("in-1")],
            timeout_ms: Some(500),
        };
        let bytes = rmp_serde::to_vec(&assign).unwrap();
        let back: Assign = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, assign);
    }
}
