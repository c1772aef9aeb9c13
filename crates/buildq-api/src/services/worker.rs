//! Worker-facing calls: the instruction stream and the executor stream.

use std::sync::Arc;
use std::time::Duration;

use buildq_core::ports::{LogStash, LogWriter};
use buildq_core::protocol::{
    ExecutorEnlist, LogLine, TaskError, TaskRequest, TaskStatus, TaskUpdate, WorkerAction,
    WorkerAllocation, WorkerError, WorkerRequest, WorkerStatus, WorkerUpdate,
};
use buildq_core::{Error, Result};
use buildq_scheduler::{Build, Executor, Scheduler, Task, Worker};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Clone)]
pub struct WorkerService {
    scheduler: Arc<dyn Scheduler>,
    logs: Arc<dyn LogStash>,
    executor_init_timeout: Duration,
}

impl WorkerService {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        logs: Arc<dyn LogStash>,
        executor_init_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            logs,
            executor_init_timeout,
        }
    }

    /// Serve one worker connection. `enlist` is the first message the worker
    /// sent; the worker is unregistered when the stream ends.
    pub async fn get_instructions(
        &self,
        enlist: WorkerUpdate,
        inbound: mpsc::Receiver<WorkerUpdate>,
        out: mpsc::Sender<WorkerRequest>,
    ) -> Result<()> {
        if enlist.status != WorkerStatus::Enlisting {
            return Err(Error::BadRequest(format!(
                "expected enlisting, got {:?}",
                enlist.status
            )));
        }
        let platform = enlist.platform.unwrap_or_default();
        let task_platform = enlist.task_platform.unwrap_or_default();

        let worker = self.scheduler.new_worker(platform, task_platform)?;
        let result = self.instruct(worker.as_ref(), inbound, &out).await;
        worker.close();
        result
    }

    async fn instruct(
        &self,
        worker: &dyn Worker,
        mut inbound: mpsc::Receiver<WorkerUpdate>,
        out: &mpsc::Sender<WorkerRequest>,
    ) -> Result<()> {
        let mut current: Option<Arc<Build>> = None;
        // Cancellation of the current build; a fresh token while idle.
        let mut watch = CancellationToken::new();

        loop {
            tokio::select! {
                _ = watch.cancelled() => {
                    watch = CancellationToken::new();
                    let Some(build) = current.as_ref() else {
                        continue;
                    };
                    info!(build_id = %build.id(), worker_id = %worker.id(), "Interrupting build");
                    let request = WorkerRequest {
                        action: WorkerAction::CancelBuild,
                        build_id: build.id().clone(),
                        worker_id: worker.id(),
                        environment: None,
                    };
                    if out.send(request).await.is_err() {
                        trace!(worker_id = %worker.id(), "Worker write error");
                        return Ok(());
                    }
                }
                _ = worker.cancelled() => {
                    debug!(worker_id = %worker.id(), "Worker cancelled");
                    return Ok(());
                }
                build = worker.next_build() => {
                    let Some(build) = build else {
                        return Ok(());
                    };
                    if current.is_some() {
                        panic!("Got a new build assignment while another build is in progress");
                    }
                    let environment = match build.environment() {
                        Some(environment) if !build.is_done() => environment,
                        _ => {
                            debug!(build_id = %build.id(), worker_id = %worker.id(), "Build assignment already done");
                            worker.acknowledge();
                            continue;
                        }
                    };

                    let request = WorkerRequest {
                        action: WorkerAction::Build,
                        build_id: build.id().clone(),
                        worker_id: worker.id(),
                        environment: Some(environment.as_ref().clone()),
                    };
                    watch = build.cancel_token();
                    current = Some(build);
                    if out.send(request).await.is_err() {
                        trace!(worker_id = %worker.id(), "Worker write error");
                        return Ok(());
                    }
                }
                update = inbound.recv() => {
                    let Some(update) = update else {
                        trace!(worker_id = %worker.id(), "Worker stream closed");
                        return Ok(());
                    };
                    match update.status {
                        WorkerStatus::BuildEnded => {}
                        WorkerStatus::DeployFailed | WorkerStatus::ExecutorFailed => {
                            self.report_failure(worker, current.as_deref(), &update);
                        }
                        WorkerStatus::Enlisting => {
                            warn!(worker_id = %worker.id(), "Unexpected enlist on an enlisted worker");
                            continue;
                        }
                    }
                    current = None;
                    watch = CancellationToken::new();
                    worker.acknowledge();
                }
            }
        }
    }

    /// Fail the task the worker was assigned and record the error in its log.
    fn report_failure(&self, worker: &dyn Worker, build: Option<&Build>, update: &WorkerUpdate) {
        let kind = match update.status {
            WorkerStatus::DeployFailed => "Deployment Error",
            WorkerStatus::ExecutorFailed => "Executor Error",
            _ => "Worker Error",
        };
        let Some(build) = build else {
            debug!(worker_id = %worker.id(), kind, "Worker failure with no build in progress");
            return;
        };
        let error = update.error.clone().unwrap_or_else(|| WorkerError {
            message: kind.to_string(),
            details: String::new(),
        });
        debug!(
            build_id = %build.id(),
            worker_id = %worker.id(),
            message = %error.message,
            "{kind}"
        );

        // The assignment is still waiting unclaimed if the executor never
        // came up; otherwise the executor stream returns its own task.
        let executor = match self.scheduler.new_executor(worker.id(), build.id()) {
            Ok(executor) => executor,
            Err(err) => {
                debug!(build_id = %build.id(), worker_id = %worker.id(), error = %err, "No pending assignment");
                return;
            }
        };

        if let Some(task) = executor.unacknowledged() {
            let mut failure = TaskUpdate::new(task.request(), TaskStatus::Error);
            failure.worker = Some(WorkerAllocation {
                id: worker.id(),
                hostname: worker.platform().hostname().map(str::to_string),
            });
            failure.errors.push(TaskError {
                kind: kind.to_string(),
                location: worker.id().to_string(),
                message: error.message.clone(),
                details: error.details.clone(),
            });
            if task.post_update(failure) {
                self.write_details(&task, &error.details);
            }
            executor.acknowledge();
        }
        executor.close();
    }

    fn write_details(&self, task: &Task, details: &str) {
        let mut writer = match self.logs.append(task.instance()) {
            Ok(writer) => writer,
            Err(err) => {
                debug!(task_id = %task.identity(), error = %err, "Unable to append log");
                return;
            }
        };
        for line in details.trim().lines() {
            if let Err(err) = writer.write_line(&LogLine::parse(line, task.identity())) {
                debug!(task_id = %task.identity(), error = %err, "Log write failed");
                break;
            }
        }
        close_log(writer);
    }

    /// Serve one executor connection for the build and worker named in
    /// `enlist`. Ends when the executor is idle for the init timeout.
    pub async fn get_tasks(
        &self,
        enlist: ExecutorEnlist,
        inbound: mpsc::Receiver<TaskUpdate>,
        out: mpsc::Sender<TaskRequest>,
    ) -> Result<()> {
        let executor = self
            .scheduler
            .new_executor(enlist.worker_id, &enlist.build_id)
            .inspect_err(|err| {
                error!(build_id = %enlist.build_id, worker_id = %enlist.worker_id, error = %err, "Executor failed to enlist");
            })?;

        let result = self.execute(executor.as_ref(), inbound, &out).await;
        executor.close();
        result
    }

    async fn execute(
        &self,
        executor: &dyn Executor,
        mut inbound: mpsc::Receiver<TaskUpdate>,
        out: &mpsc::Sender<TaskRequest>,
    ) -> Result<()> {
        let worker_id = executor.worker_id();
        let mut current: Option<Arc<Task>> = None;
        let mut log: Option<Box<dyn LogWriter>> = None;

        let idle = tokio::time::sleep(self.executor_init_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut idle, if current.is_none() => {
                    debug!(build_id = %executor.build_id(), worker_id = %worker_id, "Executor idle");
                    break;
                }
                _ = executor.cancelled() => {
                    break;
                }
                task = executor.next_task() => {
                    let Some(task) = task else {
                        break;
                    };
                    if current.is_some() {
                        panic!("Got a new task assignment while another task is in progress");
                    }
                    debug!(task_id = %task.identity(), instance = %task.instance(), worker_id = %worker_id, "Running task");

                    task.set_matched_platform(executor.platform().clone());
                    log = match self.logs.append(task.instance()) {
                        Ok(writer) => Some(writer),
                        Err(err) => {
                            debug!(task_id = %task.identity(), error = %err, "Unable to append log");
                            None
                        }
                    };
                    let request = task.request();
                    current = Some(task);
                    if out.send(request).await.is_err() {
                        trace!(worker_id = %worker_id, "Executor write error");
                        break;
                    }
                }
                update = inbound.recv() => {
                    let Some(update) = update else {
                        break;
                    };
                    let Some(task) = current.clone() else {
                        debug!(worker_id = %worker_id, "Task update with no task in progress");
                        continue;
                    };
                    if update.request.task_id != task.identity() {
                        debug!(task_id = %update.request.task_id, worker_id = %worker_id, "Task update for a task not in progress");
                        continue;
                    }
                    trace!(task_id = %task.identity(), status = ?update.status, "Task update");

                    if let Some(writer) = log.as_mut() {
                        for line in &update.loglines {
                            if let Err(err) = writer.write_line(line) {
                                debug!(task_id = %task.identity(), error = %err, "Log write failed");
                            }
                        }
                    }

                    let status = update.status;
                    task.post_update(update);

                    if status.is_completed() {
                        debug!(task_id = %task.identity(), worker_id = %worker_id, ?status, "Task ended");
                        executor.acknowledge();
                        current = None;
                        if let Some(writer) = log.take() {
                            close_log(writer);
                        }
                        idle.as_mut().reset(Instant::now() + self.executor_init_timeout);
                    }
                }
            }
        }

        if let Some(writer) = log.take() {
            close_log(writer);
        }
        Ok(())
    }
}

fn close_log(mut writer: Box<dyn LogWriter>) {
    if let Err(err) = writer.close() {
        debug!(error = %err, "Log close failed");
    }
}

