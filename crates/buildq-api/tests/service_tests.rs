//! Stream services driven over in-process channels with the scheduler
//! loop running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use buildq_api::services::{SchedulerService, WorkerService};
use buildq_core::ids::WorkerId;
use buildq_core::logstash::MemoryLogStash;
use buildq_core::platform::Platform;
use buildq_core::ports::LogStash;
use buildq_core::protocol::{
    BuildEnvironment, BuildRequest, BuildStatus, BuildUpdate, ExecutorEnlist, LogLevel, LogLine,
    TaskDescriptor, TaskRequest, TaskStatus, TaskUpdate, WorkerAction, WorkerError,
    WorkerRequest, WorkerStatus, WorkerUpdate,
};
use buildq_core::{Error, Result};
use buildq_scheduler::{PriorityScheduler, Scheduler, SchedulerConfig};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    scheduler: Arc<PriorityScheduler>,
    logs: Arc<MemoryLogStash>,
    client: SchedulerService,
    workers: WorkerService,
    shutdown: CancellationToken,
}

impl Harness {
    fn start(config: SchedulerConfig) -> Self {
        let scheduler = PriorityScheduler::new(config);
        let logs = Arc::new(MemoryLogStash::default());
        let shutdown = CancellationToken::new();
        let runner = Arc::clone(&scheduler);
        let token = shutdown.clone();
        tokio::spawn(async move { runner.run(token).await });

        Self {
            client: SchedulerService::new(scheduler.clone()),
            workers: WorkerService::new(scheduler.clone(), logs.clone(), Duration::from_millis(200)),
            scheduler,
            logs,
            shutdown,
        }
    }

    fn schedule_build(
        &self,
        request: BuildRequest,
    ) -> (mpsc::Receiver<BuildUpdate>, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        (rx, tokio::spawn(async move { client.schedule_build(request, tx).await }))
    }

    fn schedule_task(
        &self,
        request: TaskRequest,
    ) -> (mpsc::Receiver<TaskUpdate>, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        (rx, tokio::spawn(async move { client.schedule_task(request, tx).await }))
    }

    fn enlist_worker(&self) -> WorkerConn {
        let (update_tx, update_rx) = mpsc::channel(16);
        let (request_tx, request_rx) = mpsc::channel(16);
        let workers = self.workers.clone();
        let enlist = WorkerUpdate::enlist(Platform::with_defaults(), Platform::new());
        let handle =
            tokio::spawn(async move { workers.get_instructions(enlist, update_rx, request_tx).await });
        WorkerConn {
            updates: update_tx,
            requests: request_rx,
            handle,
        }
    }

    fn open_executor(&self, worker_id: WorkerId, build_id: &buildq_core::BuildId) -> ExecutorConn {
        let (update_tx, update_rx) = mpsc::channel(16);
        let (request_tx, request_rx) = mpsc::channel(16);
        let workers = self.workers.clone();
        let enlist = ExecutorEnlist {
            worker_id,
            build_id: build_id.clone(),
        };
        let handle =
            tokio::spawn(async move { workers.get_tasks(enlist, update_rx, request_tx).await });
        ExecutorConn {
            updates: update_tx,
            requests: request_rx,
            handle,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct WorkerConn {
    updates: mpsc::Sender<WorkerUpdate>,
    requests: mpsc::Receiver<WorkerRequest>,
    handle: JoinHandle<Result<()>>,
}

struct ExecutorConn {
    updates: mpsc::Sender<TaskUpdate>,
    requests: mpsc::Receiver<TaskRequest>,
    handle: JoinHandle<Result<()>>,
}

fn build_request(tasks: &[&str]) -> BuildRequest {
    let tasks: BTreeMap<String, TaskDescriptor> = tasks
        .iter()
        .map(|id| {
            (
                id.to_string(),
                TaskDescriptor {
                    identity: id.to_string(),
                    instance: String::new(),
                    name: id.to_string(),
                    platform: Platform::new(),
                },
            )
        })
        .collect();
    BuildRequest {
        environment: BuildEnvironment {
            tasks,
            client: serde_json::json!({ "workspace": "demo" }),
        },
        priority: 0,
        logstream: false,
    }
}

async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
}

async fn ended<T>(rx: &mut mpsc::Receiver<T>) -> bool {
    matches!(timeout(WAIT, rx.recv()).await, Ok(None))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn finished(handle: JoinHandle<Result<()>>) -> Result<()> {
    timeout(WAIT, handle).await.expect("stream did not end").unwrap()
}

#[tokio::test]
async fn test_build_stream_accepts_then_cancels() {
    let h = Harness::start(SchedulerConfig::default());
    let (mut updates, handle) = h.schedule_build(build_request(&["compile"]));

    let accepted = recv(&mut updates).await;
    assert_eq!(accepted.status, BuildStatus::Accepted);

    assert_eq!(h.client.cancel_build(&accepted.build_id).unwrap(), BuildStatus::Cancelled);
    let cancelled = recv(&mut updates).await;
    assert_eq!(cancelled.status, BuildStatus::Cancelled);
    assert_eq!(cancelled.build_id, accepted.build_id);

    assert!(ended(&mut updates).await);
    finished(handle).await.unwrap();
}

#[tokio::test]
async fn test_identical_requests_share_a_build() {
    let h = Harness::start(SchedulerConfig::default());
    let (mut first, _h1) = h.schedule_build(build_request(&["compile"]));
    let (mut second, _h2) = h.schedule_build(build_request(&["compile"]));

    let a = recv(&mut first).await;
    let b = recv(&mut second).await;
    assert_eq!(a.build_id, b.build_id);
    assert_eq!(h.scheduler.list_builds(false).len(), 1);
}

#[tokio::test]
async fn test_build_rejected_without_eligible_worker() {
    let config = SchedulerConfig::default().with_reject_ineligible_builds(true);
    let h = Harness::start(config);
    let (_updates, handle) = h.schedule_build(build_request(&["compile"]));

    let err = finished(handle).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)), "{err}");
}

#[tokio::test]
async fn test_schedule_unknown_task() {
    let h = Harness::start(SchedulerConfig::default());
    let (mut updates, _handle) = h.schedule_build(build_request(&["compile"]));
    let accepted = recv(&mut updates).await;

    let (_, handle) = h.schedule_task(TaskRequest {
        build_id: accepted.build_id,
        task_id: "missing".to_string(),
    });
    let err = finished(handle).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn test_worker_must_enlist_first() {
    let h = Harness::start(SchedulerConfig::default());
    let (_tx, rx) = mpsc::channel(1);
    let (tx, _rx) = mpsc::channel(1);
    let err = h
        .workers
        .get_instructions(WorkerUpdate::status(WorkerStatus::BuildEnded), rx, tx)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)), "{err}");
    assert!(h.scheduler.list_workers().is_empty());
}

#[tokio::test]
async fn test_executor_without_assignment() {
    let h = Harness::start(SchedulerConfig::default());
    let (mut updates, _handle) = h.schedule_build(build_request(&["compile"]));
    let accepted = recv(&mut updates).await;

    let executor = h.open_executor(WorkerId::new(), &accepted.build_id);
    let err = finished(executor.handle).await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

#[tokio::test]
async fn test_end_to_end() {
    let h = Harness::start(SchedulerConfig::default());
    let mut worker = h.enlist_worker();

    let (mut build_updates, build_handle) = h.schedule_build(build_request(&["compile"]));
    let build_id = recv(&mut build_updates).await.build_id;
    let (mut task_updates, task_handle) = h.schedule_task(TaskRequest {
        build_id: build_id.clone(),
        task_id: "compile".to_string(),
    });

    let instruction = recv(&mut worker.requests).await;
    assert_eq!(instruction.action, WorkerAction::Build);
    assert_eq!(instruction.build_id, build_id);
    let environment = instruction.environment.unwrap();
    assert_eq!(environment.client["workspace"], "demo");
    assert!(environment.tasks.contains_key("compile"));

    let mut executor = h.open_executor(instruction.worker_id, &build_id);
    let request = recv(&mut executor.requests).await;
    assert_eq!(request.task_id, "compile");

    let mut running = TaskUpdate::new(request.clone(), TaskStatus::Running);
    running.loglines.push(LogLine::new(LogLevel::Info, "compiling", "compile"));
    executor.updates.send(running).await.unwrap();
    assert_eq!(recv(&mut task_updates).await.status, TaskStatus::Running);

    executor
        .updates
        .send(TaskUpdate::new(request, TaskStatus::Passed))
        .await
        .unwrap();
    let passed = recv(&mut task_updates).await;
    assert_eq!(passed.status, TaskStatus::Passed);
    assert!(passed.loglines.is_empty());
    assert!(ended(&mut task_updates).await);
    finished(task_handle).await.unwrap();

    // With nothing left to run the executor stream times out.
    finished(executor.handle).await.unwrap();
    worker
        .updates
        .send(WorkerUpdate::status(WorkerStatus::BuildEnded))
        .await
        .unwrap();

    let task = h.scheduler.get_build(&build_id).unwrap().task("compile").unwrap();
    let mut reader = h.logs.read(task.instance()).unwrap();
    let line = reader.read_line().unwrap().unwrap();
    assert_eq!(line.message, "compiling");

    let stats = h.scheduler.statistics();
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.successful_tasks, 1);

    h.client.cancel_build(&build_id).unwrap();
    assert_eq!(recv(&mut build_updates).await.status, BuildStatus::Cancelled);
    finished(build_handle).await.unwrap();

    drop(worker.updates);
    finished(worker.handle).await.unwrap();
    assert!(h.scheduler.list_workers().is_empty());
}

#[tokio::test]
async fn test_deployment_failure_reported_on_task() {
    let h = Harness::start(SchedulerConfig::default());
    let mut worker = h.enlist_worker();

    let (mut build_updates, _build_handle) = h.schedule_build(build_request(&["compile"]));
    let build_id = recv(&mut build_updates).await.build_id;
    let (mut task_updates, task_handle) = h.schedule_task(TaskRequest {
        build_id: build_id.clone(),
        task_id: "compile".to_string(),
    });

    let instruction = recv(&mut worker.requests).await;
    assert_eq!(instruction.action, WorkerAction::Build);

    let mut failure = WorkerUpdate::status(WorkerStatus::DeployFailed);
    failure.error = Some(WorkerError {
        message: "image pull failed".to_string(),
        details: "[  ERROR] registry unreachable\nretry later\n".to_string(),
    });
    worker.updates.send(failure).await.unwrap();

    let update = recv(&mut task_updates).await;
    assert_eq!(update.status, TaskStatus::Error);
    assert_eq!(update.errors.len(), 1);
    assert_eq!(update.errors[0].kind, "Deployment Error");
    assert_eq!(update.errors[0].message, "image pull failed");
    assert_eq!(update.errors[0].location, instruction.worker_id.to_string());
    assert_eq!(update.worker.unwrap().id, instruction.worker_id);
    finished(task_handle).await.unwrap();

    // The worker is released once the failure has been recorded.
    assert!(eventually(|| h.scheduler.list_workers().iter().all(|w| w.available)).await);

    let task = h.scheduler.get_build(&build_id).unwrap().task("compile").unwrap();
    let mut reader = h.logs.read(task.instance()).unwrap();
    let first = reader.read_line().unwrap().unwrap();
    assert_eq!((first.level, first.message.as_str()), (LogLevel::Error, "registry unreachable"));
    let second = reader.read_line().unwrap().unwrap();
    assert_eq!((second.level, second.message.as_str()), (LogLevel::Stdout, "retry later"));
    assert!(reader.read_line().unwrap().is_none());
    assert_eq!(h.scheduler.list_workers().len(), 1);
}

#[tokio::test]
async fn test_cancelled_build_interrupts_worker() {
    let h = Harness::start(SchedulerConfig::default());
    let mut worker = h.enlist_worker();

    let (mut build_updates, _build_handle) = h.schedule_build(build_request(&["compile"]));
    let build_id = recv(&mut build_updates).await.build_id;
    let (_task_updates, _task_handle) = h.schedule_task(TaskRequest {
        build_id: build_id.clone(),
        task_id: "compile".to_string(),
    });

    let instruction = recv(&mut worker.requests).await;
    assert_eq!(instruction.action, WorkerAction::Build);

    h.client.cancel_build(&build_id).unwrap();
    let interrupt = recv(&mut worker.requests).await;
    assert_eq!(interrupt.action, WorkerAction::CancelBuild);
    assert_eq!(interrupt.build_id, build_id);
    assert!(interrupt.environment.is_none());
}
