use std::collections::{HashMap, HashSet};
use std::time::Duration;

use cogwheel_core::config::ExecutorSettings;
use cogwheel_core::{
    Config, ConfigError, FallbackPolicy, GraphNode, PayloadId, PeerId, TaskId, TaskStatus,
};
use cogwheel_graph::{
    DecompositionRegistry, DependencyGraph, SynthesisPolicy, SynthesisStrategy,
};
use cogwheel_mesh::{DistributedCoordinator, Message};
use cogwheel_scheduler::{
    KeyUpdate, PriorityCalculator, PriorityInputs, ReadyQueue, RecomputeTrigger,
    SchedulerMetrics,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus};
use crate::executor::Job;

/// A side effect requested by the context.
#[derive(Debug, Clone)]
pub enum Action {
    /// Start a job on the local worker pool.
    Run(Job),
    /// Signal a local job to stop.
    Abort(TaskId),
    /// Send to one peer. When `task` is set, a failed send reclaims it.
    Send {
        peer: PeerId,
        message: Message,
        task: Option<TaskId>,
    },
    Broadcast(Message),
}

pub struct SchedulerContext {
    pub(super) graph: DependencyGraph,
    pub(super) queue: ReadyQueue,
    pub(super) calculator: PriorityCalculator,
    pub(super) coordinator: DistributedCoordinator,
    pub(super) metrics: SchedulerMetrics,
    pub(super) events: EventBus,
    pub(super) decomposers: DecompositionRegistry,
    pub(super) synthesis: Box<dyn SynthesisStrategy>,
    pub(super) executor: ExecutorSettings,
    /// Terminal nodes older than this are garbage-collected.
    pub(super) retention: Duration,
    /// Own tasks executing on the local pool.
    pub(super) running: HashSet<TaskId>,
    /// Ready tasks that no known node can run.
    pub(super) deferred: HashSet<TaskId>,
    /// Aggregates waiting for `resolve_synthesis`.
    pub(super) held: HashSet<TaskId>,
    /// Token of the latest job started per task, own or foreign.
    pub(super) runs: HashMap<TaskId, u64>,
    pub(super) next_run: u64,
    pub(super) actions: Vec<Action>,
}

impl SchedulerContext {
    pub fn new(config: &Config, local: PeerId) -> Result<Self, EngineError> {
        let fallback = match (
            config.graph.best_effort_fallback.as_str(),
            &config.graph.substitute_payload,
        ) {
            ("substitute", Some(payload)) => FallbackPolicy::Substitute(PayloadId::new(payload)),
            _ => FallbackPolicy::Proceed,
        };
        let synthesis: SynthesisPolicy = config
            .graph
            .synthesis_policy
            .parse()
            .map_err(ConfigError::Invalid)?;

        info!(
            peer = %local,
            synthesis = %synthesis,
            fan_out = config.graph.fan_out,
            "scheduler context ready"
        );
        Ok(Self {
            graph: DependencyGraph::new(fallback),
            queue: ReadyQueue::new(),
            calculator: PriorityCalculator::from_settings(&config.scheduler),
            coordinator: DistributedCoordinator::new(
                local,
                config.local_capabilities(),
                &config.mesh,
            ),
            metrics: SchedulerMetrics::default(),
            events: EventBus::new(),
            decomposers: DecompositionRegistry::with_defaults(config.graph.fan_out),
            synthesis: Box::new(synthesis),
            executor: config.executor.clone(),
            retention: Duration::from_secs(config.graph.retention_secs),
            running: HashSet::new(),
            deferred: HashSet::new(),
            held: HashSet::new(),
            runs: HashMap::new(),
            next_run: 0,
            actions: Vec::new(),
        })
    }

    pub fn set_synthesis_strategy(&mut self, strategy: Box<dyn SynthesisStrategy>) {
        self.synthesis = strategy;
    }

    pub fn set_decomposition_registry(&mut self, registry: DecompositionRegistry) {
        self.decomposers = registry;
    }

    pub fn local_peer(&self) -> &PeerId {
        self.coordinator.local_peer()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn queue(&self) -> &ReadyQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &DistributedCoordinator {
        &self.coordinator
    }

    /// Side effects queued since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    // ── Caller operations ─────────────────────────────────────

    /// Insert a node. It is queued immediately if its dependencies are met.
    pub fn submit(&mut self, node: GraphNode) -> Result<TaskId, EngineError> {
        let id = self.graph.add_node(node)?;
        self.metrics.tasks_submitted += 1;
        self.events.publish(EngineEvent::TaskCreated { task: id });
        info!(task = %id, "task submitted");

        if self.graph.status(&id) == Some(TaskStatus::CompletedFailure) {
            // A dependency had already failed.
            self.note_failed(id);
        } else if self.graph.is_ready(&id) {
            self.enqueue(id)?;
        }
        Ok(id)
    }

    /// Cancel a task wherever it is. Returns false if it had already
    /// finished.
    pub fn cancel(&mut self, id: TaskId) -> Result<bool, EngineError> {
        let status = self.graph.status(&id).ok_or(EngineError::TaskNotFound(id))?;
        if status.is_terminal() {
            debug!(task = %id, %status, "cancel ignored, task already finished");
            return Ok(false);
        }

        self.unqueue(&id);
        if self.running.remove(&id) {
            self.actions.push(Action::Abort(id));
        }
        if let Some(peer) = self.coordinator.release(&id) {
            self.send_cancel(peer, id)?;
        }

        let settled = self.graph.mark_canceled(&id)?;
        self.metrics.tasks_canceled += 1;
        self.events.publish(EngineEvent::TaskCanceled { task: id });
        info!(task = %id, "task canceled");
        self.settle(settled)?;
        Ok(true)
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus, EngineError> {
        self.graph.status(id).ok_or(EngineError::TaskNotFound(*id))
    }

    pub fn task(&self, id: &TaskId) -> Result<GraphNode, EngineError> {
        self.graph
            .get(id)
            .cloned()
            .ok_or(EngineError::TaskNotFound(*id))
    }

    /// Split a pending node into children; the node itself becomes an
    /// aggregate resolved by synthesis.
    pub fn decompose(&mut self, id: TaskId) -> Result<Vec<TaskId>, EngineError> {
        let children = self.graph.decompose(&id, &self.decomposers)?;
        self.unqueue(&id);
        for child in &children {
            self.metrics.tasks_submitted += 1;
            self.events.publish(EngineEvent::TaskCreated { task: *child });
            if self.graph.is_ready(child) {
                self.enqueue(*child)?;
            }
        }
        Ok(children)
    }

    /// Complete a held aggregate with an externally chosen result.
    pub fn resolve_synthesis(&mut self, id: TaskId, result: PayloadId) -> Result<(), EngineError> {
        if !self.held.remove(&id) {
            return Err(EngineError::NotHeld(id));
        }
        self.graph.mark_running(&id)?;
        info!(task = %id, result = %result, "synthesis resolved manually");
        self.finish_success(id, result)
    }

    /// Re-evaluate a queued task's key now.
    pub fn recompute_priority(&mut self, id: TaskId) -> Result<KeyUpdate, EngineError> {
        let inputs = self.priority_inputs(&id)?;
        let update = self
            .calculator
            .apply(&mut self.queue, &id, &inputs, RecomputeTrigger::Override)?;
        if let KeyUpdate::Lowered { to, .. } = update {
            self.graph.set_effective_priority(&id, to);
        }
        Ok(update)
    }

    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<EngineEvent> {
        self.events.subscribe(capacity)
    }

    /// Counters plus current gauges.
    pub fn metrics(&self, busy_workers: usize, pool_size: usize) -> SchedulerMetrics {
        let mut snapshot = self.metrics.clone();
        snapshot.queue_depth = self.queue.len();
        snapshot.deferred = self.deferred.len();
        snapshot.dropped_events = self.events.dropped();
        snapshot.set_utilization(busy_workers, pool_size);
        snapshot
    }

    // ── Shared helpers ────────────────────────────────────────

    pub(super) fn priority_inputs(&self, id: &TaskId) -> Result<PriorityInputs, EngineError> {
        let node = self.graph.get(id).ok_or(EngineError::TaskNotFound(*id))?;
        Ok(PriorityInputs::for_task(
            &node.task,
            self.graph.completed_dependencies(id),
            Utc::now(),
        ))
    }

    /// Take a task out of every waiting set.
    pub(super) fn unqueue(&mut self, id: &TaskId) {
        if self.queue.contains(id) {
            // Present, so removal cannot fail.
            let _ = self.queue.remove(id);
        }
        self.deferred.remove(id);
        self.held.remove(id);
    }

    /// Token for a new job of `id`; reports from earlier jobs stop counting.
    pub(super) fn issue_run(&mut self, id: TaskId) -> u64 {
        self.next_run += 1;
        self.runs.insert(id, self.next_run);
        self.next_run
    }

    /// Tasks holding a local worker slot, own or foreign.
    pub(super) fn local_load(&self) -> u32 {
        (self.running.len() + self.coordinator.foreign_count()) as u32
    }
}
