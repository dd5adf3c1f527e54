//! Bounded worker pool for local payload execution.
//!
//! Each job runs on its own tokio task, waits for a pool permit, resolves its
//! payload through the store and hands it to the [`TaskRunner`]. Attempts are
//! bounded by a wall-clock timeout; on timeout (or cancellation) the attempt's
//! [`CancelFlag`] is raised and the runner gets `cancel_grace` to return
//! before it is aborted. Failed attempts are retried with exponential backoff
//! up to `max_retries`. Workers never touch scheduler state: every outcome is
//! sent as a [`WorkerReport`] on the pool's report queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use cogwheel_core::config::ExecutorSettings;
use cogwheel_core::{PayloadId, PayloadStore, StorageError, TaskId};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;

// ── Cancellation ─────────────────────────────────────────────────────

/// Cooperative cancellation signal shared between the pool and a runner.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Runners should check this at their yield points.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is raised.
    pub async fn canceled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}

// ── Runner boundary ──────────────────────────────────────────────────

/// Everything a runner gets for one attempt.
pub struct RunContext {
    pub task_id: TaskId,
    /// Zero-based attempt number.
    pub attempt: u32,
    pub payload: Bytes,
    /// Resolved dependency results, in dependency order. Best-effort inputs
    /// that produced nothing are omitted.
    pub inputs: Vec<Bytes>,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("{0}")]
    Failed(String),

    #[error("canceled")]
    Canceled,
}

/// Interprets opaque payloads.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError>;
}

#[async_trait]
impl<T: TaskRunner + ?Sized> TaskRunner for Arc<T> {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError> {
        (**self).run(ctx).await
    }
}

/// Returns the payload unchanged.
pub struct EchoRunner;

#[async_trait]
impl TaskRunner for EchoRunner {
    async fn run(&self, ctx: RunContext) -> Result<Bytes, RunError> {
        Ok(ctx.payload)
    }
}

// ── Jobs and reports ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: TaskId,
    pub payload_ref: PayloadId,
    pub inputs: Vec<PayloadId>,
    pub timeout: Duration,
    /// Attempts already spent on this task.
    pub first_attempt: u32,
    /// Assignment token echoed in every report of this job. A task that is
    /// started again gets a new one, so reports from the stopped job can be
    /// told apart.
    pub run: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Started {
        task: TaskId,
        run: u64,
    },
    Retrying {
        task: TaskId,
        run: u64,
        attempt: u32,
        error: String,
    },
    Completed {
        task: TaskId,
        run: u64,
        result: PayloadId,
        elapsed: Duration,
    },
    Failed {
        task: TaskId,
        run: u64,
        error: String,
    },
    Canceled {
        task: TaskId,
        run: u64,
    },
}

impl WorkerReport {
    pub fn task(&self) -> TaskId {
        match self {
            WorkerReport::Started { task, .. }
            | WorkerReport::Retrying { task, .. }
            | WorkerReport::Completed { task, .. }
            | WorkerReport::Failed { task, .. }
            | WorkerReport::Canceled { task, .. } => *task,
        }
    }

    /// Token of the job that sent this report.
    pub fn run(&self) -> u64 {
        match self {
            WorkerReport::Started { run, .. }
            | WorkerReport::Retrying { run, .. }
            | WorkerReport::Completed { run, .. }
            | WorkerReport::Failed { run, .. }
            | WorkerReport::Canceled { run, .. } => *run,
        }
    }

    /// The job sends nothing after a terminal report.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerReport::Completed { .. } | WorkerReport::Failed { .. } | WorkerReport::Canceled { .. }
        )
    }
}

/// Control handle for a spawned job.
pub struct JobHandle {
    run: u64,
    cancel: CancelFlag,
}

impl JobHandle {
    pub fn run(&self) -> u64 {
        self.run
    }

    /// Signal the job; it reports `Canceled` once the runner has stopped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

// ── Pool ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runner: Arc<dyn TaskRunner>,
    store: Arc<dyn PayloadStore>,
    permits: Arc<Semaphore>,
    capacity: usize,
    busy: AtomicUsize,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    cancel_grace: Duration,
    reports: mpsc::Sender<WorkerReport>,
}

enum Attempt {
    Done(PayloadId, Duration),
    Failed(String),
    Canceled,
}

enum Race<T> {
    Joined(T),
    TimedOut,
    Canceled,
}

impl WorkerPool {
    pub fn new(
        settings: &ExecutorSettings,
        runner: Arc<dyn TaskRunner>,
        store: Arc<dyn PayloadStore>,
        reports: mpsc::Sender<WorkerReport>,
    ) -> Self {
        let capacity = settings.resolved_max_workers();
        Self {
            inner: Arc::new(PoolInner {
                runner,
                store,
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                busy: AtomicUsize::new(0),
                max_retries: settings.max_retries,
                backoff_base: Duration::from_millis(settings.backoff_base_ms),
                backoff_max: Duration::from_millis(settings.backoff_max_ms),
                cancel_grace: Duration::from_millis(settings.cancel_grace_ms),
                reports,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Workers currently running an attempt.
    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Delay before retrying after failed attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.inner.backoff(attempt)
    }

    pub fn spawn(&self, job: Job) -> JobHandle {
        let cancel = CancelFlag::new();
        let run = job.run;
        let inner = Arc::clone(&self.inner);
        let flag = cancel.clone();
        tokio::spawn(async move { inner.drive(job, flag).await });
        JobHandle { run, cancel }
    }
}

impl PoolInner {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    async fn report(&self, report: WorkerReport) {
        if self.reports.send(report).await.is_err() {
            debug!("report queue closed");
        }
    }

    async fn drive(&self, job: Job, cancel: CancelFlag) {
        let task = job.task_id;
        let run = job.run;
        let mut attempt = job.first_attempt;
        let mut started = false;

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = cancel.canceled() => {
                    self.report(WorkerReport::Canceled { task, run }).await;
                    return;
                }
            };
            if !started {
                started = true;
                self.report(WorkerReport::Started { task, run }).await;
            }

            self.busy.fetch_add(1, Ordering::Relaxed);
            let outcome = self.attempt(&job, attempt, &cancel).await;
            self.busy.fetch_sub(1, Ordering::Relaxed);
            drop(permit);

            let error = match outcome {
                Attempt::Done(result, elapsed) => {
                    self.report(WorkerReport::Completed {
                        task,
                        run,
                        result,
                        elapsed,
                    })
                    .await;
                    return;
                }
                Attempt::Canceled => {
                    self.report(WorkerReport::Canceled { task, run }).await;
                    return;
                }
                Attempt::Failed(error) => error,
            };

            if attempt >= self.max_retries {
                self.report(WorkerReport::Failed { task, run, error }).await;
                return;
            }

            let delay = self.backoff(attempt);
            attempt += 1;
            warn!(task = %task, attempt, ?delay, %error, "attempt failed, retrying");
            self.report(WorkerReport::Retrying {
                task,
                run,
                attempt,
                error,
            })
            .await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.canceled() => {
                    self.report(WorkerReport::Canceled { task, run }).await;
                    return;
                }
            }
        }
    }

    async fn resolve(&self, job: &Job) -> Result<(Bytes, Vec<Bytes>), StorageError> {
        let payload = self.store.get(&job.payload_ref).await?;
        let mut inputs = Vec::with_capacity(job.inputs.len());
        for id in &job.inputs {
            inputs.push(self.store.get(id).await?);
        }
        Ok((payload, inputs))
    }

    async fn attempt(&self, job: &Job, attempt: u32, cancel: &CancelFlag) -> Attempt {
        let task = job.task_id;
        let started = Instant::now();
        let (payload, inputs) = match self.resolve(job).await {
            Ok(resolved) => resolved,
            Err(e) => return Attempt::Failed(EngineError::from(e).to_string()),
        };

        let flag = CancelFlag::new();
        let ctx = RunContext {
            task_id: task,
            attempt,
            payload,
            inputs,
            cancel: flag.clone(),
        };
        let runner = Arc::clone(&self.runner);
        let mut run = tokio::spawn(async move { runner.run(ctx).await });
        debug!(task = %task, attempt, "attempt started");

        let race = tokio::select! {
            joined = &mut run => Race::Joined(joined),
            _ = tokio::time::sleep(job.timeout) => Race::TimedOut,
            _ = cancel.canceled() => Race::Canceled,
        };

        match race {
            Race::Joined(Ok(Ok(bytes))) => match self.store.put(bytes).await {
                Ok(result) => Attempt::Done(result, started.elapsed()),
                Err(e) => Attempt::Failed(EngineError::from(e).to_string()),
            },
            Race::Joined(Ok(Err(RunError::Failed(error)))) => Attempt::Failed(error),
            Race::Joined(Ok(Err(RunError::Canceled))) => {
                Attempt::Failed("runner canceled itself".into())
            }
            Race::Joined(Err(e)) => Attempt::Failed(format!("worker panicked: {e}")),
            Race::TimedOut => {
                flag.cancel();
                self.wind_down(task, run).await;
                let timeout_ms = job.timeout.as_millis() as u64;
                Attempt::Failed(EngineError::TaskTimeout { task, timeout_ms }.to_string())
            }
            Race::Canceled => {
                flag.cancel();
                self.wind_down(task, run).await;
                Attempt::Canceled
            }
        }
    }

    /// Give a signaled runner the grace period, then abort it.
    async fn wind_down(&self, task: TaskId, mut run: JoinHandle<Result<Bytes, RunError>>) {
        if tokio::time::timeout(self.cancel_grace, &mut run).await.is_err() {
            warn!(task = %task, grace = ?self.cancel_grace, "runner ignored cancel signal, aborting");
            run.abort();
        }
    }
}

#[cfg(test)]
mod tests;
