//! Delegation bookkeeping for one node.
//!
//! The coordinator is owned by the engine's serialization point and never
//! performs I/O itself: it decides placements, tracks who is running what,
//! stamps outgoing messages with the Merkle clock and arbitrates completion
//! reports. The engine does the sending.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use cogwheel_core::config::MeshSettings;
use cogwheel_core::{Capabilities, PayloadId, PeerId, Requirements, TaskId};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{CausalOrder, ClockHash, MerkleClock};
use crate::error::MeshError;
use crate::message::Message;
use crate::protocol::Proposal;
use crate::score::score;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub capabilities: Capabilities,
    /// Tasks this node currently has delegated to the peer.
    pub assigned: u32,
    /// Set by a rejection; cleared by the next advertisement or report.
    pub saturated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Local,
    Remote(PeerId),
    /// Someone qualifies but nobody has capacity right now.
    Wait,
    /// No known node satisfies the hard requirements.
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationState {
    Proposed,
    Assigned,
}

#[derive(Debug, Clone)]
pub struct Delegation {
    pub task_id: TaskId,
    pub peer: PeerId,
    pub state: DelegationState,
    pub correlation_id: Uuid,
    /// Last sign of life: proposal, acceptance or heartbeat.
    pub last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReportOutcome {
    Success(PayloadId),
    Failure(String),
}

/// Authoritative completion report for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub peer: PeerId,
    pub clock: ClockHash,
    pub outcome: ReportOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arbitration {
    /// First valid report: apply it to the graph. `supersedes` names a
    /// still-running assignee that should be told to stop.
    Accept { supersedes: Option<PeerId> },
    /// The task is already settled; this report replaces the ledger entry.
    Authoritative,
    /// Dropped.
    Stale,
}

/// A task this node runs on behalf of another.
#[derive(Debug, Clone)]
pub struct ForeignTask {
    pub owner: PeerId,
    pub correlation_id: Uuid,
}

pub struct DistributedCoordinator {
    local: PeerId,
    local_caps: Capabilities,
    clock: MerkleClock,
    peers: BTreeMap<PeerId, PeerInfo>,
    delegations: HashMap<TaskId, Delegation>,
    /// Peers a task was taken away from.
    former: HashMap<TaskId, BTreeSet<PeerId>>,
    ledger: HashMap<TaskId, LedgerEntry>,
    foreign: HashMap<TaskId, ForeignTask>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    load_penalty: f64,
}

impl DistributedCoordinator {
    pub fn new(local: PeerId, local_caps: Capabilities, settings: &MeshSettings) -> Self {
        let heartbeat_interval = Duration::from_millis(settings.heartbeat_interval_ms);
        Self {
            clock: MerkleClock::new(local.clone(), settings.clock_history),
            local,
            local_caps,
            peers: BTreeMap::new(),
            delegations: HashMap::new(),
            former: HashMap::new(),
            ledger: HashMap::new(),
            foreign: HashMap::new(),
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * settings.heartbeat_miss_limit.max(1),
            load_penalty: settings.load_penalty,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    pub fn local_capabilities(&self) -> &Capabilities {
        &self.local_caps
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn clock(&self) -> &MerkleClock {
        &self.clock
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, PeerInfo> {
        &self.peers
    }

    pub fn delegation(&self, task: &TaskId) -> Option<&Delegation> {
        self.delegations.get(task)
    }

    pub fn delegated_count(&self) -> usize {
        self.delegations.len()
    }

    pub fn ledger(&self, task: &TaskId) -> Option<&LedgerEntry> {
        self.ledger.get(task)
    }

    pub fn foreign(&self, task: &TaskId) -> Option<&ForeignTask> {
        self.foreign.get(task)
    }

    pub fn foreign_count(&self) -> usize {
        self.foreign.len()
    }

    /// Stamp and wrap a payload for sending.
    pub fn message<T: Serialize>(&mut self, topic: &str, payload: &T) -> Result<Message, MeshError> {
        let clock = self.clock.stamp(topic);
        Message::new(topic, self.local.clone(), clock, payload)
    }

    pub fn reply<T: Serialize>(
        &mut self,
        topic: &str,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Message, MeshError> {
        let clock = self.clock.stamp(topic);
        Message::with_correlation(topic, self.local.clone(), clock, payload, correlation_id)
    }

    /// Fold an inbound message's clock into ours.
    pub fn observe(&mut self, message: &Message) -> Result<(), MeshError> {
        self.clock.merge(&message.clock)
    }

    // ── Membership ────────────────────────────────────────────

    /// Record a capability advertisement. Returns true for a newly known peer.
    pub fn peer_advertised(&mut self, peer: PeerId, capabilities: Capabilities) -> bool {
        if peer == self.local {
            return false;
        }
        match self.peers.get_mut(&peer) {
            Some(info) => {
                info.capabilities = capabilities;
                info.saturated = false;
                false
            }
            None => {
                info!(peer = %peer, "peer joined mesh");
                self.peers.insert(
                    peer,
                    PeerInfo {
                        capabilities,
                        assigned: 0,
                        saturated: false,
                    },
                );
                true
            }
        }
    }

    /// Forget a peer. Returns the tasks that were delegated to it, already
    /// released for reassignment.
    pub fn peer_disconnected(&mut self, peer: &PeerId) -> Vec<TaskId> {
        if self.peers.remove(peer).is_some() {
            info!(peer = %peer, "peer left mesh");
        }
        let lost: Vec<TaskId> = self
            .delegations
            .values()
            .filter(|d| d.peer == *peer)
            .map(|d| d.task_id)
            .collect();
        for task in &lost {
            self.reclaim(task);
        }
        lost
    }

    pub fn update_local_load(&mut self, load: f64) {
        self.local_caps.load = load.clamp(0.0, 1.0);
    }

    // ── Placement ─────────────────────────────────────────────

    /// Choose where a ready task runs. `local_running` counts tasks occupying
    /// local workers.
    pub fn place(&self, req: &Requirements, local_running: u32) -> Placement {
        let local = score(req, &self.local_caps, local_running, self.load_penalty);
        let mut best: Option<(&PeerId, f64)> = None;
        let mut anyone_qualifies = req.satisfied_by(&self.local_caps);

        for (peer, info) in &self.peers {
            if !req.satisfied_by(&info.capabilities) {
                continue;
            }
            anyone_qualifies = true;
            if info.saturated {
                continue;
            }
            if let Some(s) = score(req, &info.capabilities, info.assigned, self.load_penalty) {
                if best.map_or(true, |(_, b)| s > b) {
                    best = Some((peer, s));
                }
            }
        }

        match (local, best) {
            (Some(l), Some((_, r))) if l >= r => Placement::Local,
            (_, Some((peer, _))) => Placement::Remote(peer.clone()),
            (Some(_), None) => Placement::Local,
            (None, None) if anyone_qualifies => Placement::Wait,
            (None, None) => Placement::Defer,
        }
    }

    // ── Owner side ────────────────────────────────────────────

    /// Open a delegation and build its proposal.
    pub fn propose(
        &mut self,
        task_id: TaskId,
        peer: PeerId,
        requirements: Requirements,
        now: Instant,
    ) -> (Proposal, Uuid) {
        let correlation_id = Uuid::new_v4();
        if let Some(info) = self.peers.get_mut(&peer) {
            info.assigned += 1;
        }
        debug!(task = %task_id, peer = %peer, "proposing");
        self.delegations.insert(
            task_id,
            Delegation {
                task_id,
                peer,
                state: DelegationState::Proposed,
                correlation_id,
                last_seen: now,
            },
        );
        (
            Proposal {
                task_id,
                requirements,
            },
            correlation_id,
        )
    }

    /// The peer took the task. Returns false if the acceptance is not for an
    /// open proposal from that peer.
    pub fn accepted(&mut self, task_id: &TaskId, peer: &PeerId, now: Instant) -> bool {
        match self.delegations.get_mut(task_id) {
            Some(d) if d.peer == *peer && d.state == DelegationState::Proposed => {
                d.state = DelegationState::Assigned;
                d.last_seen = now;
                info!(task = %task_id, peer = %peer, "delegated");
                true
            }
            _ => false,
        }
    }

    /// The peer declined. Returns false if there was no such proposal.
    pub fn rejected(&mut self, task_id: &TaskId, peer: &PeerId) -> bool {
        match self.delegations.get(task_id) {
            Some(d) if d.peer == *peer && d.state == DelegationState::Proposed => {
                self.release(task_id);
                if let Some(info) = self.peers.get_mut(peer) {
                    info.saturated = true;
                }
                true
            }
            _ => false,
        }
    }

    /// Refresh the delegations a heartbeat mentions.
    pub fn heartbeat(&mut self, peer: &PeerId, tasks: &[TaskId], now: Instant) {
        for task in tasks {
            if let Some(d) = self.delegations.get_mut(task) {
                if d.peer == *peer {
                    d.last_seen = now;
                }
            }
        }
    }

    /// Release delegations whose peer has been silent past the heartbeat
    /// timeout. The returned tasks, paired with the peer that lost them, must be
    /// requeued by the caller.
    pub fn expire(&mut self, now: Instant) -> Vec<(TaskId, PeerId)> {
        let timeout = self.heartbeat_timeout;
        let expired: Vec<(TaskId, PeerId)> = self
            .delegations
            .values()
            .filter(|d| now.saturating_duration_since(d.last_seen) > timeout)
            .map(|d| (d.task_id, d.peer.clone()))
            .collect();
        for (task, peer) in &expired {
            warn!(task = %task, peer = %peer, "heartbeat timeout, reassigning");
            self.reclaim(task);
        }
        expired
    }

    /// Take a task back from its assignee (timeout, disconnect or send
    /// failure). The assignee stays eligible to report.
    pub fn reclaim(&mut self, task_id: &TaskId) -> Option<PeerId> {
        let peer = self.release(task_id)?;
        self.clock.tick(format!("reassign:{task_id}"));
        self.former.entry(*task_id).or_default().insert(peer.clone());
        Some(peer)
    }

    /// Drop a delegation without recording it as former (cancel, reject).
    pub fn release(&mut self, task_id: &TaskId) -> Option<PeerId> {
        let d = self.delegations.remove(task_id)?;
        if let Some(info) = self.peers.get_mut(&d.peer) {
            info.assigned = info.assigned.saturating_sub(1);
        }
        Some(d.peer)
    }

    /// Judge a completion report from `reporter` whose clock head is `clock`.
    pub fn arbitrate(
        &mut self,
        task_id: &TaskId,
        reporter: &PeerId,
        clock: ClockHash,
        outcome: ReportOutcome,
    ) -> Arbitration {
        let is_current = self
            .delegations
            .get(task_id)
            .is_some_and(|d| d.peer == *reporter);
        let is_former = self
            .former
            .get(task_id)
            .is_some_and(|peers| peers.contains(reporter));
        let is_local = *reporter == self.local;

        if let Some(info) = self.peers.get_mut(reporter) {
            info.saturated = false;
        }

        if !(is_current || is_former || is_local) {
            warn!(task = %task_id, peer = %reporter, "report from a peer that never held the task");
            return Arbitration::Stale;
        }

        if let Some(existing) = self.ledger.get(task_id) {
            let order = self.clock.compare(&clock, &existing.clock);
            return if order == CausalOrder::After {
                debug!(task = %task_id, peer = %reporter, "later report recorded as authoritative");
                self.ledger.insert(
                    *task_id,
                    LedgerEntry {
                        peer: reporter.clone(),
                        clock,
                        outcome,
                    },
                );
                Arbitration::Authoritative
            } else {
                warn!(task = %task_id, peer = %reporter, ?order, "stale completion report dropped");
                Arbitration::Stale
            };
        }

        // A former assignee's failure says nothing about the live attempt.
        if is_former && !is_current && matches!(outcome, ReportOutcome::Failure(_)) {
            warn!(task = %task_id, peer = %reporter, "failure from reclaimed assignee ignored");
            return Arbitration::Stale;
        }

        let supersedes = if is_current {
            self.release(task_id);
            None
        } else {
            self.release(task_id)
        };
        self.ledger.insert(
            *task_id,
            LedgerEntry {
                peer: reporter.clone(),
                clock,
                outcome,
            },
        );
        Arbitration::Accept { supersedes }
    }

    /// Arbitrate a report produced by this node.
    pub fn arbitrate_local(&mut self, task_id: &TaskId, outcome: ReportOutcome) -> Arbitration {
        let clock = self.clock.tick(format!("complete:{task_id}"));
        let local = self.local.clone();
        self.arbitrate(task_id, &local, clock, outcome)
    }

    /// Drop all bookkeeping for a task (canceled or garbage-collected).
    pub fn forget(&mut self, task_id: &TaskId) {
        self.release(task_id);
        self.former.remove(task_id);
        self.ledger.remove(task_id);
    }

    // ── Assignee side ─────────────────────────────────────────

    /// Whether to take on a proposed task.
    pub fn consider(&self, proposal: &Proposal, local_running: u32) -> Result<(), String> {
        if !proposal.requirements.satisfied_by(&self.local_caps) {
            return Err("requirements not met".into());
        }
        if local_running >= self.local_caps.max_tasks {
            return Err("at capacity".into());
        }
        Ok(())
    }

    pub fn adopt(&mut self, task_id: TaskId, owner: PeerId, correlation_id: Uuid) {
        debug!(task = %task_id, owner = %owner, "running task for peer");
        self.foreign.insert(task_id, ForeignTask { owner, correlation_id });
    }

    pub fn finish_foreign(&mut self, task_id: &TaskId) -> Option<ForeignTask> {
        self.foreign.remove(task_id)
    }

    /// Foreign tasks grouped by owner, for heartbeats.
    pub fn foreign_by_owner(&self) -> BTreeMap<PeerId, Vec<TaskId>> {
        let mut by_owner: BTreeMap<PeerId, Vec<TaskId>> = BTreeMap::new();
        for (task, f) in &self.foreign {
            by_owner.entry(f.owner.clone()).or_default().push(*task);
        }
        by_owner
    }
}
