//! Cumulative scheduler counters.

use std::sync::atomic::{AtomicU64, Ordering};

use buildq_core::protocol::TaskStatus;

/// Counters that survive the builds they describe.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Builds closed by the stale sweep.
    pub completed_builds: AtomicU64,
    /// Tasks that ended FAILED, ERROR or UNSTABLE.
    pub failed_tasks: AtomicU64,
    /// Tasks that ended PASSED, SKIPPED, UPLOADED or DOWNLOADED.
    pub successful_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    /// Build deliveries made by matching passes.
    pub assignments: AtomicU64,
    pub passes: AtomicU64,
}

impl SchedulerMetrics {
    pub fn record_task_status(&self, status: TaskStatus) {
        if status.is_failure() {
            self.failed_tasks.fetch_add(1, Ordering::Relaxed);
            self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        } else if status.is_success() {
            self.successful_tasks.fetch_add(1, Ordering::Relaxed);
            self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_build_closed(&self) {
        self.completed_builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self, assignments: usize) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.assignments
            .fetch_add(assignments as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed_builds: self.completed_builds.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            successful_tasks: self.successful_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            assignments: self.assignments.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub completed_builds: u64,
    pub failed_tasks: u64,
    pub successful_tasks: u64,
    pub completed_tasks: u64,
    pub assignments: u64,
    pub passes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_outcomes() {
        let metrics = SchedulerMetrics::default();
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Passed,
            TaskStatus::Skipped,
            TaskStatus::Failed,
            TaskStatus::Unstable,
            TaskStatus::Cancelled,
        ] {
            metrics.record_task_status(status);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.successful_tasks, 2);
        assert_eq!(snap.failed_tasks, 2);
        assert_eq!(snap.completed_tasks, 4);
    }
}
