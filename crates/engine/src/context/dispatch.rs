use std::time::Duration;

use chrono::{DateTime, Utc};
use cogwheel_core::{PayloadId, PeerId, TaskId, TaskStatus};
use cogwheel_graph::{DependencyInput, Settled, Synthesis};
use cogwheel_mesh::protocol::{TaskFailure, TaskResult};
use cogwheel_mesh::{topics, Arbitration, Placement, ReportOutcome};
use cogwheel_scheduler::{KeyUpdate, RecomputeTrigger};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::core::{Action, SchedulerContext};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::executor::{Job, WorkerReport};

impl SchedulerContext {
    // ── Queue maintenance ─────────────────────────────────────

    /// Queue a ready task at its current effective priority.
    pub(super) fn enqueue(&mut self, id: TaskId) -> Result<(), EngineError> {
        let inputs = self.priority_inputs(&id)?;
        let key = self.calculator.effective_priority(&inputs);
        self.queue.push(id, key)?;
        self.graph.set_effective_priority(&id, key);
        self.events.publish(EngineEvent::TaskReady { task: id, key });
        debug!(task = %id, key, "task ready");
        Ok(())
    }

    /// Return a task taken from `from` to the queue with the urgency boost.
    pub(super) fn requeue(&mut self, id: TaskId, from: PeerId) -> Result<(), EngineError> {
        match self.graph.status(&id) {
            Some(TaskStatus::Scheduled | TaskStatus::Running) => {}
            _ => return Ok(()),
        }
        if self.graph.reset_to_pending(&id)? {
            self.enqueue(id)?;
            let key = self.calculator.boost(&mut self.queue, &id)?;
            self.graph.set_effective_priority(&id, key);
        }
        self.metrics.tasks_reassigned += 1;
        self.events.publish(EngineEvent::TaskReassigned { task: id, from: from.clone() });
        info!(task = %id, from = %from, "task requeued for reassignment");
        Ok(())
    }

    /// Apply the side effects of a terminal transition.
    pub(super) fn settle(&mut self, settled: Settled) -> Result<(), EngineError> {
        for id in settled.failed {
            self.unqueue(&id);
            self.note_failed(id);
        }
        for id in settled.ready {
            self.enqueue(id)?;
        }
        Ok(())
    }

    /// Count and announce a task that is already `CompletedFailure`.
    pub(super) fn note_failed(&mut self, id: TaskId) {
        let error = self
            .graph
            .get(&id)
            .and_then(|n| n.task.error.clone())
            .unwrap_or_default();
        self.metrics.tasks_failed += 1;
        self.events.publish(EngineEvent::TaskFailed { task: id, error });
    }

    /// Move deferred tasks back to the queue; called when the mesh changes.
    pub(super) fn retry_deferred(&mut self) -> Result<(), EngineError> {
        let deferred: Vec<TaskId> = self.deferred.drain().collect();
        for id in deferred {
            if self.graph.status(&id) == Some(TaskStatus::Pending) && self.graph.is_ready(&id) {
                self.enqueue(id)?;
            }
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Place ready tasks in key order until the head cannot be placed.
    ///
    /// A head that must wait for capacity blocks the tasks behind it, so a
    /// higher-priority task is never overtaken by a cheaper one.
    pub fn dispatch(&mut self, now: Instant) -> Result<(), EngineError> {
        while let Some((id, _)) = self.queue.peek() {
            let Some(node) = self.graph.get(&id) else {
                self.queue.pop();
                continue;
            };
            if node.is_aggregate() {
                self.queue.pop();
                self.synthesize(id)?;
                continue;
            }

            let requirements = node.task.requirements.clone();
            match self.coordinator.place(&requirements, self.local_load()) {
                Placement::Local => {
                    self.queue.pop();
                    self.start_local(id)?;
                }
                Placement::Remote(peer) => {
                    self.queue.pop();
                    self.delegate(id, peer, now)?;
                }
                Placement::Wait => break,
                Placement::Defer => {
                    self.queue.pop();
                    self.graph.mark_scheduled(&id)?;
                    self.graph.reset_to_pending(&id)?;
                    self.deferred.insert(id);
                    warn!(task = %id, ?requirements, "no capable node known, task deferred");
                }
            }
        }
        Ok(())
    }

    /// Dependency results the task runs with, in dependency order.
    pub(super) fn input_ids(&self, id: &TaskId) -> Result<Vec<PayloadId>, EngineError> {
        Ok(self
            .graph
            .inputs(id)?
            .into_iter()
            .filter_map(|(_, input)| match input {
                DependencyInput::Ready(p) | DependencyInput::Substituted(p) => Some(p),
                DependencyInput::Missing => None,
            })
            .collect())
    }

    fn start_local(&mut self, id: TaskId) -> Result<(), EngineError> {
        self.graph.mark_scheduled(&id)?;
        self.graph.mark_running(&id)?;
        let inputs = self.input_ids(&id)?;
        let run = self.issue_run(id);
        let node = self.graph.get(&id).ok_or(EngineError::TaskNotFound(id))?;
        let job = Job {
            task_id: id,
            payload_ref: node.task.payload_ref.clone(),
            inputs,
            timeout: Duration::from_millis(
                node.task.timeout_ms.unwrap_or(self.executor.task_timeout_ms),
            ),
            first_attempt: node.task.retry_count,
            run,
        };
        self.running.insert(id);
        self.actions.push(Action::Run(job));
        debug!(task = %id, "dispatched locally");
        Ok(())
    }

    fn delegate(&mut self, id: TaskId, peer: PeerId, now: Instant) -> Result<(), EngineError> {
        self.graph.mark_scheduled(&id)?;
        self.graph.set_owner(&id, Some(peer.clone()));
        let requirements = self
            .graph
            .get(&id)
            .map(|n| n.task.requirements.clone())
            .unwrap_or_default();
        let (proposal, correlation_id) =
            self.coordinator.propose(id, peer.clone(), requirements, now);
        let message = self
            .coordinator
            .reply(topics::PROPOSE, &proposal, correlation_id)?;
        self.actions.push(Action::Send {
            peer,
            message,
            task: Some(id),
        });
        Ok(())
    }

    fn synthesize(&mut self, id: TaskId) -> Result<(), EngineError> {
        self.graph.mark_scheduled(&id)?;
        let children = self.graph.child_results(&id);
        match self.synthesis.synthesize(&children) {
            Synthesis::Resolved(result) => {
                self.graph.mark_running(&id)?;
                info!(task = %id, result = %result, children = children.len(), "synthesized");
                self.finish_success(id, result)
            }
            Synthesis::Unresolved(reason) => {
                self.graph.mark_running(&id)?;
                self.finish_failure(id, reason)
            }
            Synthesis::Held => {
                self.held.insert(id);
                self.events.publish(EngineEvent::SynthesisPending { task: id });
                info!(task = %id, children = children.len(), "synthesis awaiting resolution");
                Ok(())
            }
        }
    }

    // ── Completion ────────────────────────────────────────────

    pub(super) fn finish_success(&mut self, id: TaskId, result: PayloadId) -> Result<(), EngineError> {
        let settled = self.graph.mark_complete(&id, result.clone())?;
        self.events.publish(EngineEvent::TaskCompleted { task: id, result });
        self.settle(settled)?;
        self.reprioritize_dependents(&id)
    }

    /// Lower the keys of `id`'s unfinished dependents now that one more of
    /// their dependencies has succeeded.
    fn reprioritize_dependents(&mut self, id: &TaskId) -> Result<(), EngineError> {
        let dependents: Vec<TaskId> = match self.graph.get(id) {
            Some(node) => node.task.dependent_ids.iter().copied().collect(),
            None => return Ok(()),
        };
        for dependent in dependents {
            let Some(node) = self.graph.get(&dependent) else {
                continue;
            };
            if node.task.status.is_terminal() {
                continue;
            }
            let current = node.task.effective_priority;
            let inputs = self.priority_inputs(&dependent)?;
            let update = if self.queue.contains(&dependent) {
                self.calculator.apply(
                    &mut self.queue,
                    &dependent,
                    &inputs,
                    RecomputeTrigger::DependencySettled,
                )?
            } else {
                self.calculator.recompute(current, &inputs)
            };
            if let KeyUpdate::Lowered { from, to } = update {
                self.graph.set_effective_priority(&dependent, to);
                debug!(task = %dependent, dependency = %id, from, to, "dependency progress lowered key");
            }
        }
        Ok(())
    }

    pub(super) fn finish_failure(&mut self, id: TaskId, error: String) -> Result<(), EngineError> {
        let settled = self.graph.mark_failed(&id, error.clone())?;
        self.metrics.tasks_failed += 1;
        self.events.publish(EngineEvent::TaskFailed { task: id, error });
        self.settle(settled)
    }

    /// Bring a task to `Running` so an accepted report can settle it,
    /// wherever it currently is. Returns false for finished tasks.
    pub(super) fn ensure_running(&mut self, id: TaskId) -> Result<bool, EngineError> {
        match self.graph.status(&id) {
            Some(TaskStatus::Pending) => {
                self.unqueue(&id);
                self.graph.mark_scheduled(&id)?;
                self.graph.mark_running(&id)?;
            }
            Some(TaskStatus::Scheduled) => self.graph.mark_running(&id)?,
            Some(TaskStatus::Running) => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Apply an accepted report to the graph.
    pub(super) fn apply_outcome(
        &mut self,
        id: TaskId,
        outcome: ReportOutcome,
        supersedes: Option<PeerId>,
    ) -> Result<(), EngineError> {
        if let Some(peer) = supersedes {
            info!(task = %id, peer = %peer, "result superseded running assignee");
            self.send_cancel(peer, id)?;
        }
        if self.running.remove(&id) {
            self.actions.push(Action::Abort(id));
        }
        if !self.ensure_running(id)? {
            return Ok(());
        }
        match outcome {
            ReportOutcome::Success(result) => self.finish_success(id, result),
            ReportOutcome::Failure(error) => self.finish_failure(id, error),
        }
    }

    // ── Worker reports ────────────────────────────────────────

    pub fn on_report(&mut self, report: WorkerReport) -> Result<(), EngineError> {
        let task = report.task();
        if self.runs.get(&task) != Some(&report.run()) {
            debug!(task = %task, run = report.run(), "report from replaced job ignored");
            return Ok(());
        }
        if report.is_terminal() {
            self.runs.remove(&task);
        }
        if self.coordinator.foreign(&task).is_some() {
            return self.on_foreign_report(report);
        }
        match report {
            WorkerReport::Started { task, .. } => {
                self.events.publish(EngineEvent::TaskStarted { task, peer: None });
            }
            WorkerReport::Retrying { task, attempt, .. } => {
                self.graph.record_retry(&task);
                self.metrics.tasks_retried += 1;
                debug!(task = %task, attempt, "retry scheduled");
            }
            WorkerReport::Completed {
                task,
                result,
                elapsed,
                ..
            } => {
                if !self.running.remove(&task) {
                    debug!(task = %task, "late completion from stopped job ignored");
                    return Ok(());
                }
                if self.arbitrate_local(task, ReportOutcome::Success(result))? {
                    self.metrics.record_execution(elapsed);
                }
            }
            WorkerReport::Failed { task, error, .. } => {
                if !self.running.remove(&task) {
                    return Ok(());
                }
                error!(task = %task, %error, "local execution failed");
                self.arbitrate_local(task, ReportOutcome::Failure(error))?;
            }
            WorkerReport::Canceled { task, .. } => {
                self.running.remove(&task);
                debug!(task = %task, "local job stopped");
            }
        }
        Ok(())
    }

    /// Settle an own task from its local outcome. Returns whether the graph
    /// took it.
    fn arbitrate_local(&mut self, task: TaskId, outcome: ReportOutcome) -> Result<bool, EngineError> {
        match self.coordinator.arbitrate_local(&task, outcome.clone()) {
            Arbitration::Accept { supersedes } => {
                self.apply_outcome(task, outcome, supersedes)?;
                Ok(true)
            }
            Arbitration::Authoritative => {
                let local = self.local_peer().clone();
                self.note_authoritative(task, local, outcome);
                Ok(false)
            }
            Arbitration::Stale => Ok(false),
        }
    }

    fn on_foreign_report(&mut self, report: WorkerReport) -> Result<(), EngineError> {
        let (task, topic, outcome) = match report {
            WorkerReport::Completed { task, result, .. } => {
                (task, topics::RESULT, ReportOutcome::Success(result))
            }
            WorkerReport::Failed { task, error, .. } => {
                (task, topics::FAILURE, ReportOutcome::Failure(error))
            }
            WorkerReport::Canceled { task, .. } => {
                self.coordinator.finish_foreign(&task);
                return Ok(());
            }
            WorkerReport::Started { .. } | WorkerReport::Retrying { .. } => return Ok(()),
        };
        let Some(foreign) = self.coordinator.finish_foreign(&task) else {
            return Ok(());
        };
        let message = match outcome {
            ReportOutcome::Success(result) => {
                self.metrics.foreign_executed += 1;
                self.coordinator.reply(
                    topic,
                    &TaskResult {
                        task_id: task,
                        result,
                    },
                    foreign.correlation_id,
                )?
            }
            ReportOutcome::Failure(error) => self.coordinator.reply(
                topic,
                &TaskFailure {
                    task_id: task,
                    error,
                },
                foreign.correlation_id,
            )?,
        };
        debug!(task = %task, owner = %foreign.owner, topic, "reporting foreign task");
        self.actions.push(Action::Send {
            peer: foreign.owner,
            message,
            task: None,
        });
        Ok(())
    }

    // ── Periodic maintenance ──────────────────────────────────

    /// Age queued keys and collect expired terminal nodes.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let queued: Vec<TaskId> = self.queue.ids().copied().collect();
        for id in queued {
            let inputs = self.priority_inputs(&id)?;
            let update = self
                .calculator
                .apply(&mut self.queue, &id, &inputs, RecomputeTrigger::Tick)?;
            if let KeyUpdate::Lowered { to, .. } = update {
                self.graph.set_effective_priority(&id, to);
            }
        }

        for id in self.graph.collect_garbage(now, self.retention) {
            self.runs.remove(&id);
            self.coordinator.forget(&id);
        }
        Ok(())
    }
}
