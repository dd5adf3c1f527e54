//! Effective-priority computation.
//!
//! `effective = base - min(wait / W, 1) * Cw - (done / max(total, 1)) * Cd`
//!
//! Lower keys run first. Recomputation only ever lowers a queued key: aging
//! and dependency progress can make a task more urgent, never less.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cogwheel_core::config::SchedulerSettings;
use cogwheel_core::{TaskId, TaskNode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchedulerError;
use crate::queue::ReadyQueue;

/// Named priority strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityStrategy {
    /// Base priority adjusted by waiting time and dependency progress.
    Aging,
    /// Base priority only.
    Static,
}

impl FromStr for PriorityStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aging" => Ok(Self::Aging),
            "static" => Ok(Self::Static),
            other => Err(format!("unknown priority strategy: {other}")),
        }
    }
}

impl fmt::Display for PriorityStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aging => f.write_str("aging"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// What caused a recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecomputeTrigger {
    Tick,
    DependencySettled,
    Override,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityWeights {
    /// W in milliseconds.
    pub aging_window_ms: u64,
    /// Cw
    pub aging_weight: f64,
    /// Cd
    pub dependency_weight: f64,
    pub urgency_boost: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for PriorityWeights {
    fn from(s: &SchedulerSettings) -> Self {
        Self {
            aging_window_ms: s.aging_window_ms,
            aging_weight: s.aging_weight,
            dependency_weight: s.dependency_weight,
            urgency_boost: s.urgency_boost,
        }
    }
}

/// Task metadata the computation depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInputs {
    pub base_priority: f64,
    pub waiting_ms: u64,
    pub completed_deps: usize,
    pub total_deps: usize,
}

impl PriorityInputs {
    pub fn for_task(task: &TaskNode, completed_deps: usize, now: DateTime<Utc>) -> Self {
        let waiting_ms = (now - task.created_at).num_milliseconds().max(0) as u64;
        Self {
            base_priority: task.base_priority,
            waiting_ms,
            completed_deps,
            total_deps: task.dependency_ids.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyUpdate {
    Lowered { from: f64, to: f64 },
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PriorityCalculator {
    strategy: PriorityStrategy,
    weights: PriorityWeights,
}

impl PriorityCalculator {
    pub fn new(strategy: PriorityStrategy, weights: PriorityWeights) -> Self {
        Self { strategy, weights }
    }

    /// Build from settings that have already passed `Config::validate`.
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        let strategy = settings.strategy.parse().unwrap_or(PriorityStrategy::Aging);
        Self::new(strategy, PriorityWeights::from(settings))
    }

    pub fn strategy(&self) -> PriorityStrategy {
        self.strategy
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    pub fn effective_priority(&self, inputs: &PriorityInputs) -> f64 {
        match self.strategy {
            PriorityStrategy::Static => inputs.base_priority,
            PriorityStrategy::Aging => {
                let w = &self.weights;
                let aging = if w.aging_window_ms == 0 {
                    1.0
                } else {
                    (inputs.waiting_ms as f64 / w.aging_window_ms as f64).min(1.0)
                };
                let progress = inputs.completed_deps as f64 / inputs.total_deps.max(1) as f64;
                inputs.base_priority - aging * w.aging_weight - progress * w.dependency_weight
            }
        }
    }

    /// Key after the reassignment urgency boost.
    pub fn boosted(&self, key: f64) -> f64 {
        key - self.weights.urgency_boost
    }

    /// Compare a fresh computation against `current`; only decreases count.
    pub fn recompute(&self, current: f64, inputs: &PriorityInputs) -> KeyUpdate {
        let next = self.effective_priority(inputs);
        if next < current {
            KeyUpdate::Lowered {
                from: current,
                to: next,
            }
        } else {
            KeyUpdate::Unchanged
        }
    }

    /// Recompute a queued task and lower its heap key if the result is smaller.
    pub fn apply(
        &self,
        queue: &mut ReadyQueue,
        id: &TaskId,
        inputs: &PriorityInputs,
        trigger: RecomputeTrigger,
    ) -> Result<KeyUpdate, SchedulerError> {
        let current = queue.key_of(id).ok_or(SchedulerError::NotQueued(*id))?;
        let update = self.recompute(current, inputs);
        if let KeyUpdate::Lowered { from, to } = update {
            queue.lower_key(id, to)?;
            debug!(task = %id, ?trigger, from, to, "priority lowered");
        }
        Ok(update)
    }

    /// Apply the urgency boost to a queued task.
    pub fn boost(&self, queue: &mut ReadyQueue, id: &TaskId) -> Result<f64, SchedulerError> {
        let current = queue.key_of(id).ok_or(SchedulerError::NotQueued(*id))?;
        let to = self.boosted(current);
        if to < current {
            queue.lower_key(id, to)?;
        }
        Ok(to.min(current))
    }
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::new(PriorityStrategy::Aging, PriorityWeights::default())
    }
}
