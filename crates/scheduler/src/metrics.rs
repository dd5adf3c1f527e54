use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational counters, snapshotted by the engine on request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_canceled: u64,
    /// Attempts that were retried after a timeout or error.
    pub tasks_retried: u64,
    /// Tasks handed to a remote peer.
    pub tasks_delegated: u64,
    /// Delegations reclaimed after a heartbeat timeout.
    pub tasks_reassigned: u64,
    /// Foreign tasks this node executed for a peer.
    pub foreign_executed: u64,
    /// Tasks currently in the ready queue.
    pub queue_depth: usize,
    /// Ready tasks parked for lack of a capable peer.
    pub deferred: usize,
    /// Busy workers / pool size (0.0 - 1.0).
    pub worker_utilization: f64,
    /// Rolling average of successful local executions.
    pub avg_task_duration: Duration,
    pub last_completed: Option<DateTime<Utc>>,
    /// Events not delivered because a subscriber channel was full.
    pub dropped_events: u64,
}

impl SchedulerMetrics {
    /// Record a successful execution.
    pub fn record_execution(&mut self, duration: Duration) {
        self.tasks_completed += 1;
        self.last_completed = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.tasks_completed;
        self.avg_task_duration = if count == 1 {
            duration
        } else {
            let prev = self.avg_task_duration.as_nanos() as f64;
            let cur = duration.as_nanos() as f64;
            Duration::from_nanos((prev + (cur - prev) / count as f64) as u64)
        };
    }

    pub fn set_utilization(&mut self, busy: usize, capacity: usize) {
        self.worker_utilization = if capacity == 0 {
            0.0
        } else {
            (busy as f64 / capacity as f64).min(1.0)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_single_execution() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(Duration::from_millis(100));

        assert_eq!(m.tasks_completed, 1);
        assert!(m.last_completed.is_some());
        assert_eq!(m.avg_task_duration, Duration::from_millis(100));
    }

    #[test]
    fn record_multiple_executions_averages() {
        let mut m = SchedulerMetrics::default();
        m.record_execution(Duration::from_millis(100));
        m.record_execution(Duration::from_millis(200));

        assert_eq!(m.tasks_completed, 2);
        let avg = m.avg_task_duration.as_millis();
        assert!((140..=160).contains(&avg), "expected ~150ms, got {}ms", avg);
    }

    #[test]
    fn utilization_is_clamped() {
        let mut m = SchedulerMetrics::default();
        m.set_utilization(2, 4);
        assert_eq!(m.worker_utilization, 0.5);
        m.set_utilization(6, 4);
        assert_eq!(m.worker_utilization, 1.0);
        m.set_utilization(1, 0);
        assert_eq!(m.worker_utilization, 0.0);
    }
}
