//! Client-facing calls: schedule builds and observe tasks.

use std::sync::Arc;

use buildq_core::Result;
use buildq_core::ids::BuildId;
use buildq_core::protocol::{BuildRequest, BuildStatus, BuildUpdate, TaskRequest, TaskUpdate};
use buildq_scheduler::Scheduler;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct SchedulerService {
    scheduler: Arc<dyn Scheduler>,
}

impl SchedulerService {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    /// Register a build, or join an identical one, and stream its status
    /// until it is cancelled or the client goes away.
    pub async fn schedule_build(
        &self,
        request: BuildRequest,
        out: mpsc::Sender<BuildUpdate>,
    ) -> Result<()> {
        let id = request.digest()?;
        let build = match self.scheduler.get_build(&id) {
            Ok(build) => build,
            Err(_) => self.scheduler.new_build(id, request),
        };
        let build_id = build.id().clone();

        let mut observer = self.scheduler.schedule_build(build)?;
        info!(build_id = %build_id, "Build stream opened");

        loop {
            tokio::select! {
                update = observer.recv() => {
                    let Some(update) = update else {
                        break;
                    };
                    let cancelled = update.status == BuildStatus::Cancelled;
                    if out.send(update).await.is_err() || cancelled {
                        break;
                    }
                }
                _ = out.closed() => {
                    debug!(build_id = %build_id, "Build client disconnected");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Start a task of a scheduled build and stream its updates until it
    /// completes or the client goes away.
    pub async fn schedule_task(
        &self,
        request: TaskRequest,
        out: mpsc::Sender<TaskUpdate>,
    ) -> Result<()> {
        let mut observer = self
            .scheduler
            .schedule_task(&request.build_id, &request.task_id)?;

        loop {
            tokio::select! {
                update = observer.recv() => {
                    let Some(update) = update else {
                        break;
                    };
                    let completed = update.status.is_completed();
                    if out.send(update).await.is_err() || completed {
                        break;
                    }
                }
                _ = out.closed() => {
                    debug!(build_id = %request.build_id, task_id = %request.task_id, "Task client disconnected");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn cancel_build(&self, build_id: &BuildId) -> Result<BuildStatus> {
        self.scheduler.cancel_build(build_id)?;
        Ok(BuildStatus::Cancelled)
    }
}
