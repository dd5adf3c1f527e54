use std::time::Duration;

use cogwheel_core::{PeerId, TaskId};
use cogwheel_mesh::protocol::{
    Accept, Assign, Cancel, CapabilityAdvert, Heartbeat, Proposal, Reject, TaskFailure, TaskResult,
};
use cogwheel_mesh::{topics, Arbitration, Message, MeshError, ReportOutcome, TransportEvent};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{Action, SchedulerContext};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::executor::Job;

impl SchedulerContext {
    // ── Membership ────────────────────────────────────────────

    /// Our current capability advertisement.
    pub fn advert(&mut self) -> Result<Message, EngineError> {
        let advert = CapabilityAdvert {
            capabilities: self.coordinator.local_capabilities().clone(),
        };
        Ok(self.coordinator.message(topics::CAPABILITIES, &advert)?)
    }

    /// Announce this node to the whole mesh.
    pub fn announce(&mut self) -> Result<(), EngineError> {
        let advert = self.advert()?;
        self.actions.push(Action::Broadcast(advert));
        Ok(())
    }

    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) -> Result<(), EngineError> {
        match event {
            TransportEvent::Message(message) => self.on_message(message, now),
            TransportEvent::PeerConnected(peer) => {
                debug!(peer = %peer, "peer connected, sending capabilities");
                let advert = self.advert()?;
                self.actions.push(Action::Send {
                    peer,
                    message: advert,
                    task: None,
                });
                self.retry_deferred()
            }
            TransportEvent::PeerDisconnected(peer) => self.on_peer_lost(peer),
        }
    }

    fn on_peer_lost(&mut self, peer: PeerId) -> Result<(), EngineError> {
        for task in self.coordinator.peer_disconnected(&peer) {
            self.requeue(task, peer.clone())?;
        }
        // Work we were doing for the departed owner has nobody to report to.
        let orphaned = self
            .coordinator
            .foreign_by_owner()
            .remove(&peer)
            .unwrap_or_default();
        for task in orphaned {
            self.coordinator.finish_foreign(&task);
            self.actions.push(Action::Abort(task));
            info!(task = %task, owner = %peer, "dropping foreign task of departed owner");
        }
        Ok(())
    }

    /// A send to `peer` carrying `task` failed: take the task back.
    pub fn send_failed(&mut self, task: TaskId, peer: &PeerId) -> Result<(), EngineError> {
        let held_by_peer = self
            .coordinator
            .delegation(&task)
            .is_some_and(|d| d.peer == *peer);
        if held_by_peer {
            self.coordinator.reclaim(&task);
            self.requeue(task, peer.clone())?;
        }
        Ok(())
    }

    // ── Heartbeats ────────────────────────────────────────────

    /// Reclaim silent delegations, tell owners we are alive and refresh our
    /// advertised load.
    pub fn heartbeat(&mut self, now: Instant) -> Result<(), EngineError> {
        for (task, peer) in self.coordinator.expire(now) {
            self.requeue(task, peer)?;
        }

        for (owner, task_ids) in self.coordinator.foreign_by_owner() {
            let message = self
                .coordinator
                .message(topics::HEARTBEAT, &Heartbeat { task_ids })?;
            self.actions.push(Action::Send {
                peer: owner,
                message,
                task: None,
            });
        }

        let max = self.coordinator.local_capabilities().max_tasks.max(1);
        self.coordinator
            .update_local_load(f64::from(self.local_load()) / f64::from(max));
        self.announce()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.coordinator.heartbeat_interval()
    }

    // ── Inbound protocol ──────────────────────────────────────

    pub fn on_message(&mut self, message: Message, now: Instant) -> Result<(), EngineError> {
        if message.sender == *self.coordinator.local_peer() {
            return Ok(());
        }
        if let Err(e) = self.coordinator.observe(&message) {
            warn!(peer = %message.sender, topic = %message.topic, error = %e, "dropping message with invalid clock");
            return Ok(());
        }

        let sender = message.sender.clone();
        let correlation_id = message.correlation_id;
        match message.topic.as_str() {
            topics::CAPABILITIES => {
                let advert: CapabilityAdvert = message.decode()?;
                if self.coordinator.peer_advertised(sender.clone(), advert.capabilities) {
                    let ours = self.advert()?;
                    self.actions.push(Action::Send {
                        peer: sender,
                        message: ours,
                        task: None,
                    });
                }
                self.retry_deferred()
            }
            topics::PROPOSE => {
                let proposal: Proposal = message.decode()?;
                self.on_proposal(proposal, sender, correlation_id)
            }
            topics::ACCEPT => {
                let accept: Accept = message.decode()?;
                if self.coordinator.accepted(&accept.task_id, &sender, now) {
                    self.assign(accept.task_id, sender, correlation_id)
                } else {
                    debug!(task = %accept.task_id, peer = %sender, "unexpected acceptance, withdrawing");
                    self.send_cancel(sender, accept.task_id)
                }
            }
            topics::REJECT => {
                let reject: Reject = message.decode()?;
                if self.coordinator.rejected(&reject.task_id, &sender) {
                    info!(task = %reject.task_id, peer = %sender, reason = %reject.reason, "proposal rejected");
                    if self.graph.reset_to_pending(&reject.task_id)? {
                        self.enqueue(reject.task_id)?;
                    }
                }
                Ok(())
            }
            topics::ASSIGN => {
                let assign: Assign = message.decode()?;
                self.on_assign(assign, sender);
                Ok(())
            }
            topics::HEARTBEAT => {
                let heartbeat: Heartbeat = message.decode()?;
                self.coordinator
                    .heartbeat(&sender, &heartbeat.task_ids, now);
                Ok(())
            }
            topics::RESULT => {
                let report: TaskResult = message.decode()?;
                let outcome = ReportOutcome::Success(report.result);
                self.on_remote_report(report.task_id, sender, &message, outcome)
            }
            topics::FAILURE => {
                let report: TaskFailure = message.decode()?;
                let outcome = ReportOutcome::Failure(report.error);
                self.on_remote_report(report.task_id, sender, &message, outcome)
            }
            topics::CANCEL => {
                let cancel: Cancel = message.decode()?;
                match self.coordinator.foreign(&cancel.task_id) {
                    Some(f) if f.owner == sender => {
                        self.coordinator.finish_foreign(&cancel.task_id);
                        self.actions.push(Action::Abort(cancel.task_id));
                        debug!(task = %cancel.task_id, owner = %sender, "foreign task canceled by owner");
                    }
                    _ => {}
                }
                Ok(())
            }
            other => Err(MeshError::UnknownTopic(other.to_string()).into()),
        }
    }

    fn on_proposal(
        &mut self,
        proposal: Proposal,
        owner: PeerId,
        correlation_id: Uuid,
    ) -> Result<(), EngineError> {
        let task_id = proposal.task_id;
        let message = match self.coordinator.consider(&proposal, self.local_load()) {
            Ok(()) => {
                self.coordinator.adopt(task_id, owner.clone(), correlation_id);
                self.coordinator
                    .reply(topics::ACCEPT, &Accept { task_id }, correlation_id)?
            }
            Err(reason) => {
                debug!(task = %task_id, owner = %owner, %reason, "declining proposal");
                self.coordinator
                    .reply(topics::REJECT, &Reject { task_id, reason }, correlation_id)?
            }
        };
        self.actions.push(Action::Send {
            peer: owner,
            message,
            task: None,
        });
        Ok(())
    }

    /// The peer accepted: hand it everything it needs to run.
    fn assign(&mut self, id: TaskId, peer: PeerId, correlation_id: Uuid) -> Result<(), EngineError> {
        self.graph.mark_running(&id)?;
        self.metrics.tasks_delegated += 1;
        self.events.publish(EngineEvent::TaskStarted {
            task: id,
            peer: Some(peer.clone()),
        });

        let inputs = self.input_ids(&id)?;
        let node = self.graph.get(&id).ok_or(EngineError::TaskNotFound(id))?;
        let assign = Assign {
            task_id: id,
            payload_ref: node.task.payload_ref.clone(),
            inputs,
            timeout_ms: node.task.timeout_ms,
        };
        let message = self.coordinator.reply(topics::ASSIGN, &assign, correlation_id)?;
        self.actions.push(Action::Send {
            peer,
            message,
            task: Some(id),
        });
        Ok(())
    }

    fn on_assign(&mut self, assign: Assign, owner: PeerId) {
        match self.coordinator.foreign(&assign.task_id) {
            Some(f) if f.owner == owner => {
                let timeout_ms = assign.timeout_ms.unwrap_or(self.executor.task_timeout_ms);
                let run = self.issue_run(assign.task_id);
                self.actions.push(Action::Run(Job {
                    task_id: assign.task_id,
                    payload_ref: assign.payload_ref,
                    inputs: assign.inputs,
                    timeout: Duration::from_millis(timeout_ms),
                    first_attempt: 0,
                    run,
                }));
            }
            _ => {
                warn!(task = %assign.task_id, owner = %owner, "assignment without accepted proposal ignored");
            }
        }
    }

    fn on_remote_report(
        &mut self,
        id: TaskId,
        peer: PeerId,
        message: &Message,
        outcome: ReportOutcome,
    ) -> Result<(), EngineError> {
        match self
            .coordinator
            .arbitrate(&id, &peer, message.clock.head, outcome.clone())
        {
            Arbitration::Accept { supersedes } => {
                if matches!(outcome, ReportOutcome::Success(_)) {
                    self.metrics.tasks_completed += 1;
                    self.metrics.last_completed = Some(chrono::Utc::now());
                }
                debug!(task = %id, peer = %peer, "remote report accepted");
                self.apply_outcome(id, outcome, supersedes)
            }
            Arbitration::Authoritative => {
                self.note_authoritative(id, peer, outcome);
                Ok(())
            }
            Arbitration::Stale => Ok(()),
        }
    }

    pub(super) fn note_authoritative(&mut self, id: TaskId, peer: PeerId, outcome: ReportOutcome) {
        info!(task = %id, peer = %peer, "later report recorded, graph unchanged");
        self.events.publish(EngineEvent::AuthoritativeReport {
            task: id,
            peer,
            outcome,
        });
    }

    pub(super) fn send_cancel(&mut self, peer: PeerId, id: TaskId) -> Result<(), EngineError> {
        let message = self
            .coordinator
            .message(topics::CANCEL, &Cancel { task_id: id })?;
        self.actions.push(Action::Send {
            peer,
            message,
            task: None,
        });
        Ok(())
    }
}
