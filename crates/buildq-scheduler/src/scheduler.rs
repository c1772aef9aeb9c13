//! The scheduler contract shared by the service layer.

use std::sync::Arc;

use async_trait::async_trait;
use buildq_core::Result;
use buildq_core::ids::{BuildId, WorkerId};
use buildq_core::platform::Platform;
use buildq_core::protocol::{BuildRequest, BuildStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::build::{Build, BuildUpdateObserver};
use crate::executor::Executor;
use crate::task::{Task, TaskUpdateObserver};
use crate::worker::Worker;

/// Telemetry hooks invoked on task activity.
///
/// Called from scheduling paths while internal locks may be held;
/// implementations must return quickly and must not call back into the
/// scheduler.
pub trait SchedulerObserver: Send + Sync {
    fn task_scheduled(&self, task: &Task);

    fn task_status_changed(&self, task: &Task, status: TaskStatus);
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub workers: u64,
    pub builds: u64,
    pub completed_builds: u64,
    pub queued_tasks: u64,
    pub running_tasks: u64,
    pub failed_tasks: u64,
    pub successful_tasks: u64,
    pub completed_tasks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub instance: String,
    pub name: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
}

impl From<&Task> for TaskInfo {
    fn from(task: &Task) -> Self {
        Self {
            id: task.identity().to_string(),
            instance: task.instance().to_string(),
            name: task.name().to_string(),
            status: task.status(),
            worker: task.assigned_worker(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub id: BuildId,
    pub status: BuildStatus,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskInfo>>,
    pub has_observer: bool,
    pub has_running_task: bool,
    pub has_queued_task: bool,
    /// Present in the ready queue.
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub platform: Platform,
    pub task_platform: Platform,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_build: Option<BuildId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskInfo>,
}

/// Owns builds and workers and pairs runnable tasks with eligible workers.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Construct a build without registering it.
    fn new_build(&self, id: BuildId, request: BuildRequest) -> Arc<Build>;

    /// Register a build and start observing it. The observer receives
    /// ACCEPTED immediately.
    fn schedule_build(&self, build: Arc<Build>) -> Result<BuildUpdateObserver>;

    fn cancel_build(&self, id: &BuildId) -> Result<()>;

    fn get_build(&self, id: &BuildId) -> Result<Arc<Build>>;

    fn list_builds(&self, with_tasks: bool) -> Vec<BuildInfo>;

    fn list_workers(&self) -> Vec<WorkerInfo>;

    /// Queue a task of a registered build and observe it.
    fn schedule_task(&self, build_id: &BuildId, task_id: &str) -> Result<TaskUpdateObserver>;

    fn new_worker(&self, platform: Platform, task_platform: Platform) -> Result<Arc<dyn Worker>>;

    /// Claim the executor prepared for `worker_id` by the last matching pass.
    fn new_executor(&self, worker_id: WorkerId, build_id: &BuildId) -> Result<Box<dyn Executor>>;

    /// Request a matching pass. Never blocks; coalesces with a pending request.
    fn reschedule(&self);

    /// Drive matching until `shutdown` is cancelled.
    async fn run(&self, shutdown: CancellationToken);

    fn statistics(&self) -> Statistics;

    fn add_observer(&self, observer: Arc<dyn SchedulerObserver>);
}
