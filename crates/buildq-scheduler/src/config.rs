//! Scheduler tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the priority scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the fallback matching pass when nothing requests one.
    #[serde(default = "default_reschedule_interval_secs")]
    pub reschedule_interval_secs: u64,
    /// How long an executor stream waits for a task before giving the
    /// worker back.
    #[serde(default = "default_executor_init_timeout_secs")]
    pub executor_init_timeout_secs: u64,
    /// Refuse builds that no connected worker could run.
    #[serde(default)]
    pub reject_ineligible_builds: bool,
}

fn default_reschedule_interval_secs() -> u64 {
    60
}

fn default_executor_init_timeout_secs() -> u64 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reschedule_interval_secs: default_reschedule_interval_secs(),
            executor_init_timeout_secs: default_executor_init_timeout_secs(),
            reject_ineligible_builds: false,
        }
    }
}

impl SchedulerConfig {
    pub fn reschedule_interval(&self) -> Duration {
        Duration::from_secs(self.reschedule_interval_secs.max(1))
    }

    pub fn executor_init_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_init_timeout_secs)
    }

    pub fn with_reschedule_interval(mut self, secs: u64) -> Self {
        self.reschedule_interval_secs = secs;
        self
    }

    pub fn with_executor_init_timeout(mut self, secs: u64) -> Self {
        self.executor_init_timeout_secs = secs;
        self
    }

    pub fn with_reject_ineligible_builds(mut self, reject: bool) -> Self {
        self.reject_ineligible_builds = reject;
        self
    }
}
