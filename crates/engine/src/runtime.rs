//! The engine actor and its handle.
//!
//! One tokio task owns the [`SchedulerContext`] and multiplexes caller
//! commands, worker reports, transport events and the maintenance timers
//! with `tokio::select!`. Callers talk to it through a cloneable
//! [`EngineHandle`]; every request carries a oneshot for the reply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cogwheel_core::{
    Config, GraphNode, MemoryStore, NodeType, PayloadId, PayloadStore, PeerId, Requirements,
    TaskId, TaskNode, TaskStatus,
};
use cogwheel_graph::{DecompositionRegistry, SynthesisStrategy};
use cogwheel_mesh::{MeshError, PeerTransport, TransportEvent};
use cogwheel_scheduler::{KeyUpdate, SchedulerMetrics};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::{Action, SchedulerContext};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::executor::{EchoRunner, JobHandle, TaskRunner, WorkerPool, WorkerReport};

/// Base priority for tasks submitted through [`EngineHandle::submit_task`].
pub const DEFAULT_BASE_PRIORITY: f64 = 10.0;

const COMMAND_CAPACITY: usize = 256;
const REPORT_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Submit { node: GraphNode, reply: Reply<TaskId> },
    Cancel { id: TaskId, reply: Reply<bool> },
    Status { id: TaskId, reply: Reply<TaskStatus> },
    Task { id: TaskId, reply: Reply<GraphNode> },
    Decompose { id: TaskId, reply: Reply<Vec<TaskId>> },
    ResolveSynthesis { id: TaskId, result: PayloadId, reply: Reply<()> },
    RecomputePriority { id: TaskId, reply: Reply<KeyUpdate> },
    Subscribe { capacity: usize, reply: oneshot::Sender<mpsc::Receiver<EngineEvent>> },
    Metrics { reply: oneshot::Sender<SchedulerMetrics> },
    Shutdown { reply: oneshot::Sender<()> },
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent configuration for an [`Engine`].
///
/// # Example
/// ```ignore
/// let engine = Engine::builder(config)
///     .store(store)
///     .transport(hub.join(PeerId::from("node-a"))?)
///     .start()?;
/// let id = engine.submit_task(payload, [], Requirements::default()).await?;
/// ```
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn PayloadStore>>,
    runner: Option<Arc<dyn TaskRunner>>,
    transport: Option<Arc<dyn PeerTransport>>,
    synthesis: Option<Box<dyn SynthesisStrategy>>,
    decomposition: Option<DecompositionRegistry>,
}

impl EngineBuilder {
    /// Payload store (default: a fresh [`MemoryStore`]).
    pub fn store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Payload interpreter (default: [`EchoRunner`]).
    pub fn runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Join a mesh. Without a transport the engine runs everything locally
    /// and the transport's peer id replaces `node.peer_id`.
    pub fn transport(mut self, transport: impl PeerTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Replace the configured synthesis policy.
    pub fn synthesis(mut self, strategy: impl SynthesisStrategy + 'static) -> Self {
        self.synthesis = Some(Box::new(strategy));
        self
    }

    pub fn decomposition(mut self, registry: DecompositionRegistry) -> Self {
        self.decomposition = Some(registry);
        self
    }

    /// Validate the configuration and spawn the engine on the current tokio
    /// runtime.
    pub fn start(self) -> Result<EngineHandle, EngineError> {
        let EngineBuilder {
            config,
            store,
            runner,
            transport,
            synthesis,
            decomposition,
        } = self;
        config.validate()?;

        let peer = match &transport {
            Some(t) => t.local_peer().clone(),
            None => PeerId::new(config.node.peer_id.clone()),
        };
        let inbound = match &transport {
            Some(t) => Some(t.take_events().ok_or_else(|| {
                MeshError::Transport("transport event stream already taken".into())
            })?),
            None => None,
        };

        let mut ctx = SchedulerContext::new(&config, peer.clone())?;
        if let Some(strategy) = synthesis {
            ctx.set_synthesis_strategy(strategy);
        }
        if let Some(registry) = decomposition {
            ctx.set_decomposition_registry(registry);
        }

        let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let runner = runner.unwrap_or_else(|| Arc::new(EchoRunner));
        let (report_tx, report_rx) = mpsc::channel(REPORT_CAPACITY);
        let pool = WorkerPool::new(&config.executor, runner, store, report_tx);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let engine = Engine {
            ctx,
            pool,
            transport,
            jobs: HashMap::new(),
        };
        let tick = Duration::from_millis(config.scheduler.tick_interval_ms.max(1));
        tokio::spawn(engine.run(command_rx, report_rx, inbound, tick));

        Ok(EngineHandle {
            commands: command_tx,
            peer,
        })
    }
}

// ── Actor ────────────────────────────────────────────────────────────

pub struct Engine {
    ctx: SchedulerContext,
    pool: WorkerPool,
    transport: Option<Arc<dyn PeerTransport>>,
    jobs: HashMap<TaskId, JobHandle>,
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            runner: None,
            transport: None,
            synthesis: None,
            decomposition: None,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::Receiver<WorkerReport>,
        mut inbound: Option<mpsc::Receiver<TransportEvent>>,
        tick_every: Duration,
    ) {
        let mut tick = interval(tick_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(self.ctx.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if self.transport.is_some() {
            if let Err(e) = self.ctx.announce() {
                warn!(error = %e, "failed to build capability advert");
            }
            self.flush().await;
        }
        info!(
            peer = %self.ctx.local_peer(),
            workers = self.pool.capacity(),
            meshed = self.transport.is_some(),
            "engine started"
        );

        loop {
            let outcome = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => {
                        self.handle(command);
                        Ok(())
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(report) = reports.recv() => {
                    self.track(&report);
                    self.ctx.on_report(report)
                }
                event = next_event(&mut inbound) => match event {
                    Some(event) => self.ctx.on_transport_event(event, Instant::now()),
                    None => {
                        warn!("transport event stream closed");
                        inbound = None;
                        Ok(())
                    }
                },
                _ = tick.tick() => self.ctx.tick(Utc::now()),
                _ = heartbeat.tick() => self.ctx.heartbeat(Instant::now()),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "event handling failed");
            }
            if let Err(e) = self.ctx.dispatch(Instant::now()) {
                error!(error = %e, "dispatch failed");
            }
            self.flush().await;
        }

        info!(peer = %self.ctx.local_peer(), "engine stopped");
    }

    fn handle(&mut self, command: Command) {
        // A caller that stopped waiting has dropped its receiver.
        match command {
            Command::Submit { node, reply } => {
                let _ = reply.send(self.ctx.submit(node));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.ctx.cancel(id));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.ctx.status(&id));
            }
            Command::Task { id, reply } => {
                let _ = reply.send(self.ctx.task(&id));
            }
            Command::Decompose { id, reply } => {
                let _ = reply.send(self.ctx.decompose(id));
            }
            Command::ResolveSynthesis { id, result, reply } => {
                let _ = reply.send(self.ctx.resolve_synthesis(id, result));
            }
            Command::RecomputePriority { id, reply } => {
                let _ = reply.send(self.ctx.recompute_priority(id));
            }
            Command::Subscribe { capacity, reply } => {
                let _ = reply.send(self.ctx.subscribe(capacity));
            }
            Command::Metrics { reply } => {
                let snapshot = self.ctx.metrics(self.pool.busy(), self.pool.capacity());
                let _ = reply.send(snapshot);
            }
            Command::Shutdown { .. } => {}
        }
    }

    /// Forget handles of jobs that have stopped. A replacement job for the
    /// same task keeps its handle.
    fn track(&mut self, report: &WorkerReport) {
        if !report.is_terminal() {
            return;
        }
        let task = report.task();
        if self.jobs.get(&task).is_some_and(|job| job.run() == report.run()) {
            self.jobs.remove(&task);
        }
    }

    /// Carry out queued actions. A failed send of task traffic reclaims the
    /// task, which may queue further actions.
    async fn flush(&mut self) {
        let mut pending: VecDeque<Action> = self.ctx.take_actions().into();
        while let Some(action) = pending.pop_front() {
            match action {
                Action::Run(job) => {
                    let id = job.task_id;
                    if let Some(previous) = self.jobs.insert(id, self.pool.spawn(job)) {
                        previous.cancel();
                    }
                }
                Action::Abort(id) => {
                    if let Some(job) = self.jobs.remove(&id) {
                        job.cancel();
                    }
                }
                Action::Send {
                    peer,
                    message,
                    task,
                } => {
                    let Some(transport) = self.transport.clone() else {
                        debug!(peer = %peer, topic = %message.topic, "no transport, message dropped");
                        continue;
                    };
                    if let Err(e) = transport.send(&peer, message).await {
                        warn!(peer = %peer, error = %e, "send failed");
                        if let Some(task) = task {
                            if let Err(e) = self.ctx.send_failed(task, &peer) {
                                warn!(task = %task, error = %e, "reclaim after send failure failed");
                            }
                            pending.extend(self.ctx.take_actions());
                        }
                    }
                }
                Action::Broadcast(message) => {
                    if let Some(transport) = self.transport.clone() {
                        if let Err(e) = transport.broadcast(message).await {
                            warn!(error = %e, "broadcast failed");
                        }
                    }
                }
            }
        }
    }

    fn stop(&mut self) {
        info!(jobs = self.jobs.len(), "stopping, canceling in-flight jobs");
        for (_, job) in self.jobs.drain() {
            job.cancel();
        }
    }
}

// ── Handle ───────────────────────────────────────────────────────────

/// Cloneable entry point to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    peer: PeerId,
}

impl EngineHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| EngineError::Shutdown)?;
        rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Submit a question node over `payload` that runs once every listed
    /// dependency has succeeded.
    pub async fn submit_task(
        &self,
        payload: PayloadId,
        dependencies: impl IntoIterator<Item = TaskId>,
        requirements: Requirements,
    ) -> Result<TaskId, EngineError> {
        let mut task = TaskNode::new(payload, DEFAULT_BASE_PRIORITY).with_requirements(requirements);
        task.dependency_ids = dependencies.into_iter().collect();
        self.submit(GraphNode::new(NodeType::Question, task)).await
    }

    /// Submit a fully specified node.
    pub async fn submit(&self, node: GraphNode) -> Result<TaskId, EngineError> {
        self.request(|reply| Command::Submit { node, reply }).await?
    }

    /// Returns false if the task had already finished.
    pub async fn cancel_task(&self, id: TaskId) -> Result<bool, EngineError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    pub async fn get_task_status(&self, id: TaskId) -> Result<TaskStatus, EngineError> {
        self.request(|reply| Command::Status { id, reply }).await?
    }

    pub async fn get_task(&self, id: TaskId) -> Result<GraphNode, EngineError> {
        self.request(|reply| Command::Task { id, reply }).await?
    }

    pub async fn decompose(&self, id: TaskId) -> Result<Vec<TaskId>, EngineError> {
        self.request(|reply| Command::Decompose { id, reply }).await?
    }

    /// Settle an aggregate held by the manual synthesis policy.
    pub async fn resolve_synthesis(&self, id: TaskId, result: PayloadId) -> Result<(), EngineError> {
        self.request(|reply| Command::ResolveSynthesis { id, result, reply })
            .await?
    }

    pub async fn recompute_priority(&self, id: TaskId) -> Result<KeyUpdate, EngineError> {
        self.request(|reply| Command::RecomputePriority { id, reply })
            .await?
    }

    /// Lifecycle events from now on, through a channel of `capacity`.
    pub async fn subscribe(&self, capacity: usize) -> Result<mpsc::Receiver<EngineEvent>, EngineError> {
        self.request(|reply| Command::Subscribe { capacity, reply })
            .await
    }

    pub async fn metrics(&self) -> Result<SchedulerMetrics, EngineError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    /// Stop the engine, canceling in-flight local jobs.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
