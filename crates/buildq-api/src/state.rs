//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use buildq_core::ports::LogStash;
use buildq_scheduler::Scheduler;

use crate::handlers::metrics::SchedulerMetrics;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<dyn Scheduler>,
    pub logs: Arc<dyn LogStash>,
    /// How long an executor stream waits for a task before giving up.
    pub executor_init_timeout: Duration,
    pub metrics: Arc<SchedulerMetrics>,
}

impl AppState {
    /// Fails only if the metric series cannot be registered.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        logs: Arc<dyn LogStash>,
    ) -> Result<Self, prometheus::Error> {
        Ok(Self {
            scheduler,
            logs,
            executor_init_timeout: Duration::from_secs(3),
            metrics: Arc::new(SchedulerMetrics::new()?),
        })
    }

    pub fn with_executor_init_timeout(mut self, timeout: Duration) -> Self {
        self.executor_init_timeout = timeout;
        self
    }
}
