//! Priority scheduler.
//!
//! Ready builds are ordered by priority, highest first, then by submission
//! time. A single loop performs the matching passes: for every available
//! worker it walks the ready builds in order and binds the worker to the
//! first build holding a task the worker can run. Everything else only
//! mutates state and requests a pass.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use async_trait::async_trait;
use buildq_core::ids::{BuildId, WorkerId};
use buildq_core::platform::Platform;
use buildq_core::protocol::{BuildRequest, BuildStatus, BuildUpdate, TaskStatus};
use buildq_core::{Error, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::build::{Build, BuildUpdateObserver};
use crate::config::SchedulerConfig;
use crate::executor::{Executor, PriorityExecutor};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::queue::PriorityQueue;
use crate::scheduler::{
    BuildInfo, Scheduler, SchedulerObserver, Statistics, TaskInfo, WorkerInfo,
};
use crate::sync::{read_lock, write_lock};
use crate::task::{Task, TaskUpdateObserver};
use crate::worker::{PriorityWorker, Worker};

fn build_order(a: &Arc<Build>, b: &Arc<Build>) -> std::cmp::Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| a.scheduled_at().cmp(&b.scheduled_at()))
        .then_with(|| a.sequence().cmp(&b.sequence()))
}

fn same_build(a: &Arc<Build>, b: &Arc<Build>) -> bool {
    a.id() == b.id()
}

struct State {
    builds: HashMap<BuildId, Arc<Build>>,
    workers: HashMap<WorkerId, Arc<PriorityWorker>>,
    available: HashMap<WorkerId, Arc<PriorityWorker>>,
    // Executors bound by a matching pass, waiting to be claimed.
    executors: HashMap<WorkerId, PriorityExecutor>,
    ready: PriorityQueue<Arc<Build>>,
}

impl State {
    fn enqueue_build(&mut self, build: &Arc<Build>) {
        if build.is_done() || !self.builds.contains_key(build.id()) {
            return;
        }
        if !self.ready.contains(build) {
            trace!(build_id = %build.id(), "Moving build to ready queue");
            self.ready.push(Arc::clone(build));
        }
    }

    fn dequeue_build(&mut self, build: &Arc<Build>) {
        if self.ready.remove(build).is_some() {
            trace!(build_id = %build.id(), "Removing build from ready queue");
        }
    }

    fn check_worker_eligibility(&self, build: &Build) -> Result<()> {
        if self.workers.is_empty() {
            return Err(Error::Unavailable(
                "there are currently no workers connected".to_string(),
            ));
        }
        for task in build.tasks() {
            let eligible = self.workers.values().any(|worker| {
                worker.platform().fulfills(task.platform())
                    && task.platform().fulfills(worker.task_platform())
            });
            if !eligible {
                return Err(Error::Unavailable(format!(
                    "no eligible worker available for task {}",
                    task.name()
                )));
            }
        }
        Ok(())
    }
}

pub struct PriorityScheduler {
    me: Weak<PriorityScheduler>,
    config: SchedulerConfig,
    state: RwLock<State>,
    observers: RwLock<Vec<Arc<dyn SchedulerObserver>>>,
    wakeup: Notify,
    metrics: SchedulerMetrics,
}

impl PriorityScheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            state: RwLock::new(State {
                builds: HashMap::new(),
                workers: HashMap::new(),
                available: HashMap::new(),
                executors: HashMap::new(),
                ready: PriorityQueue::new(build_order, same_build),
            }),
            observers: RwLock::new(Vec::new()),
            wakeup: Notify::new(),
            metrics: SchedulerMetrics::default(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        read_lock(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        write_lock(&self.state)
    }

    fn observers(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn SchedulerObserver>>> {
        read_lock(&self.observers)
    }

    pub(crate) fn enqueue_build(&self, build: &Arc<Build>) {
        self.write().enqueue_build(build);
    }

    /// Make a worker available again after it finished its build.
    pub(crate) fn release_worker(&self, id: WorkerId) {
        let stale = {
            let mut state = self.write();
            let stale = state.executors.remove(&id);
            if let Some(worker) = state.workers.get(&id).cloned() {
                trace!(worker_id = %id, "Marking worker as free");
                state.available.insert(id, worker);
            }
            stale
        };
        // An unclaimed executor still holds a task: give it back.
        if let Some(executor) = stale {
            executor.close();
        }
        self.reschedule();
    }

    pub(crate) fn remove_worker(&self, id: WorkerId) {
        info!(worker_id = %id, "Worker left");
        let stale = {
            let mut state = self.write();
            state.available.remove(&id);
            state.workers.remove(&id);
            state.executors.remove(&id)
        };
        if let Some(executor) = stale {
            executor.close();
        }
        self.reschedule();
    }

    /// Close and forget builds that can no longer make progress.
    fn remove_stale_builds(&self) {
        let stale: Vec<Arc<Build>> = {
            let state = self.read();
            state
                .builds
                .values()
                .filter(|build| build.is_terminal())
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return;
        }

        {
            let mut state = self.write();
            for build in &stale {
                state.dequeue_build(build);
                state.builds.remove(build.id());
            }
        }

        for build in stale {
            info!(build_id = %build.id(), "Build removed");
            build.close();
            self.metrics.record_build_closed();
        }
    }

    /// Put builds with waiting tasks back in the ready queue.
    fn readmit_builds(&self) {
        let mut state = self.write();
        let waiting: Vec<Arc<Build>> = state
            .builds
            .values()
            .filter(|build| !build.is_done() && build.has_queued_task())
            .cloned()
            .collect();
        for build in &waiting {
            state.enqueue_build(build);
        }
    }

    /// Bind available workers to ready builds and deliver the builds.
    fn select_builds_and_workers(&self) {
        let start = Instant::now();

        let (workers, builds) = {
            let mut state = self.write();
            if state.ready.is_empty() || state.available.is_empty() {
                return;
            }
            state.ready.reorder();
            let workers: Vec<Arc<PriorityWorker>> = state.available.values().cloned().collect();
            (workers, state.ready.sorted())
        };

        let mut assignments = Vec::new();
        for worker in workers {
            if worker.is_cancelled() {
                continue;
            }
            let owner: Arc<dyn Worker> = worker.clone();
            for build in &builds {
                if build.is_done() {
                    continue;
                }
                if let Ok(executor) = build.new_executor(Arc::clone(&owner)) {
                    assignments.push((Arc::clone(&worker), Arc::clone(build), executor));
                    break;
                }
            }
        }

        let mut orphaned: Vec<Box<dyn Executor>> = Vec::new();
        let mut deliveries = Vec::new();
        {
            let mut state = self.write();
            for (worker, build, executor) in assignments {
                let id = worker.id();
                if !state.workers.contains_key(&id) {
                    orphaned.push(Box::new(executor));
                    continue;
                }
                if !build.has_queued_task() {
                    state.dequeue_build(&build);
                }
                trace!(worker_id = %id, "Marking worker as busy");
                state.available.remove(&id);
                let executor = PriorityExecutor::new(executor, Arc::clone(&build), self.me.clone());
                if let Some(stale) = state.executors.insert(id, executor) {
                    orphaned.push(Box::new(stale));
                }
                deliveries.push((worker, build));
            }
        }

        for executor in orphaned {
            executor.close();
        }

        self.metrics.record_pass(deliveries.len());
        for (worker, build) in deliveries {
            debug!(build_id = %build.id(), worker_id = %worker.id(), "Build assigned to worker");
            worker.post(build);
        }

        trace!(elapsed = ?start.elapsed(), "Matching pass finished");
    }

    fn pass(&self) {
        self.remove_stale_builds();
        self.readmit_builds();
        self.select_builds_and_workers();
    }

    fn cancel_all_builds(&self) {
        let builds: Vec<Arc<Build>> = {
            let mut state = self.write();
            let builds: Vec<Arc<Build>> = state.builds.values().cloned().collect();
            for build in &builds {
                state.dequeue_build(build);
            }
            builds
        };
        for build in builds {
            build.cancel();
        }
    }

    fn cancel_all_workers(&self) {
        let workers: Vec<Arc<PriorityWorker>> = {
            let mut state = self.write();
            state.available.clear();
            state.workers.values().cloned().collect()
        };
        for worker in workers {
            worker.cancel();
        }
    }

    fn build_info(&self, state: &State, build: &Arc<Build>, with_tasks: bool) -> BuildInfo {
        let tasks = with_tasks.then(|| {
            let mut tasks: Vec<TaskInfo> = build
                .tasks()
                .iter()
                .map(|task| TaskInfo::from(task.as_ref()))
                .collect();
            tasks.sort_by(|a, b| a.name.cmp(&b.name));
            tasks
        });
        BuildInfo {
            id: build.id().clone(),
            status: build.status(),
            priority: build.priority(),
            scheduled_at: build.scheduled_at(),
            tasks,
            has_observer: build.has_observer(),
            has_running_task: build.has_running_task(),
            has_queued_task: build.has_queued_task(),
            ready: state.ready.contains(build),
        }
    }
}

#[async_trait]
impl Scheduler for PriorityScheduler {
    fn new_build(&self, id: BuildId, request: BuildRequest) -> Arc<Build> {
        Build::new(id, request)
    }

    fn schedule_build(&self, build: Arc<Build>) -> Result<BuildUpdateObserver> {
        let mut state = self.write();

        if self.config.reject_ineligible_builds {
            if let Err(err) = state.check_worker_eligibility(&build) {
                info!(build_id = %build.id(), error = %err, "Build rejected");
                return Err(err);
            }
        }

        if build.is_done() {
            debug!(build_id = %build.id(), "Build request denied, build is done");
            return Err(Error::TerminalBuild(format!("build {} is done", build.id())));
        }

        let build = Arc::clone(
            state
                .builds
                .entry(build.id().clone())
                .or_insert_with(|| {
                    info!(build_id = %build.id(), priority = build.priority(), "Build accepted");
                    Arc::clone(&build)
                }),
        );

        let observer = build.new_update_observer();
        observer.post(BuildUpdate {
            status: BuildStatus::Accepted,
            build_id: build.id().clone(),
        });
        Ok(observer)
    }

    fn cancel_build(&self, id: &BuildId) -> Result<()> {
        let build = {
            let mut state = self.write();
            let build = state.builds.get(id).cloned().ok_or_else(|| {
                debug!(build_id = %id, "Cancel denied, no such build");
                Error::build_not_found(id)
            })?;
            state.dequeue_build(&build);
            build
        };
        build.cancel();
        self.reschedule();
        Ok(())
    }

    fn get_build(&self, id: &BuildId) -> Result<Arc<Build>> {
        self.read()
            .builds
            .get(id)
            .cloned()
            .ok_or_else(|| Error::build_not_found(id))
    }

    fn list_builds(&self, with_tasks: bool) -> Vec<BuildInfo> {
        let state = self.read();
        let mut builds: Vec<&Arc<Build>> = state.builds.values().collect();
        builds.sort_by(|a, b| build_order(a, b));
        builds
            .into_iter()
            .map(|build| self.build_info(&state, build, with_tasks))
            .collect()
    }

    fn list_workers(&self) -> Vec<WorkerInfo> {
        let state = self.read();
        let mut workers: Vec<WorkerInfo> = state
            .workers
            .values()
            .map(|worker| {
                let id = worker.id();
                let current_build = worker.current_build();
                let current_task = current_build
                    .as_ref()
                    .and_then(|build_id| state.builds.get(build_id))
                    .and_then(|build| {
                        build
                            .running_tasks()
                            .into_iter()
                            .find(|task| task.assigned_worker() == Some(id))
                    })
                    .map(|task| TaskInfo::from(task.as_ref()));
                WorkerInfo {
                    id,
                    platform: worker.platform().clone(),
                    task_platform: worker.task_platform().clone(),
                    available: state.available.contains_key(&id),
                    current_build,
                    current_task,
                }
            })
            .collect();
        workers.sort_by_key(|w| w.id.to_string());
        workers
    }

    fn schedule_task(&self, build_id: &BuildId, task_id: &str) -> Result<TaskUpdateObserver> {
        let build = self.read().builds.get(build_id).cloned().ok_or_else(|| {
            debug!(build_id = %build_id, "Task request denied, no such build");
            Error::build_not_found(build_id)
        })?;

        if build.is_done() {
            debug!(build_id = %build_id, "Task request denied, build is done");
            return Err(Error::TerminalBuild(format!("build {build_id} is done")));
        }

        let (task, observer) = build.schedule_task(task_id)?;

        let hooks: Weak<dyn SchedulerObserver> = self.me.clone();
        task.set_scheduler(hooks);
        self.task_scheduled(&task);
        debug!(build_id = %build_id, task_id = %task.identity(), name = %task.name(), "Task scheduled");

        if build.has_queued_task() {
            let mut state = self.write();
            state.enqueue_build(&build);
            if !state.available.is_empty() {
                self.reschedule();
            }
        }

        Ok(observer)
    }

    fn new_worker(&self, platform: Platform, task_platform: Platform) -> Result<Arc<dyn Worker>> {
        let worker = Arc::new(PriorityWorker::new(platform, task_platform, self.me.clone()));
        {
            let mut state = self.write();
            state.workers.insert(worker.id(), Arc::clone(&worker));
            state.available.insert(worker.id(), Arc::clone(&worker));
        }

        info!(
            worker_id = %worker.id(),
            name = %worker.display_name(),
            platform = %worker.platform(),
            task_platform = %worker.task_platform(),
            "Worker enlisted"
        );

        self.reschedule();
        Ok(worker)
    }

    fn new_executor(&self, worker_id: WorkerId, build_id: &BuildId) -> Result<Box<dyn Executor>> {
        let mut state = self.write();
        if !state.workers.contains_key(&worker_id) {
            return Err(Error::worker_not_found(worker_id));
        }
        if !state.builds.contains_key(build_id) {
            return Err(Error::build_not_found(build_id));
        }
        match state.executors.remove(&worker_id) {
            Some(executor) if executor.build_id() == build_id => {
                info!(build_id = %build_id, worker_id = %worker_id, "Executor opened");
                Ok(Box::new(executor))
            }
            Some(executor) => {
                state.executors.insert(worker_id, executor);
                Err(Error::NotFound(format!(
                    "worker {worker_id} is not assigned to build {build_id}"
                )))
            }
            None => Err(Error::NotFound(format!(
                "worker {worker_id} has no pending assignment"
            ))),
        }
    }

    fn reschedule(&self) {
        self.wakeup.notify_one();
    }

    async fn run(&self, shutdown: CancellationToken) {
        let period = self.config.reschedule_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        info!(interval = ?period, "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler stopping");
                    self.cancel_all_builds();
                    self.cancel_all_workers();
                    return;
                }
                _ = ticker.tick() => {
                    self.reschedule();
                }
                _ = self.wakeup.notified() => {
                    trace!("Rescheduling");
                    ticker.reset();
                    self.pass();
                }
            }
        }
    }

    fn statistics(&self) -> Statistics {
        let metrics = self.metrics.snapshot();
        let state = self.read();

        let mut stats = Statistics {
            workers: state.workers.len() as u64,
            builds: state.builds.len() as u64,
            completed_builds: metrics.completed_builds,
            queued_tasks: 0,
            running_tasks: 0,
            failed_tasks: metrics.failed_tasks,
            successful_tasks: metrics.successful_tasks,
            completed_tasks: metrics.completed_tasks,
        };
        for build in state.builds.values() {
            if build.is_done() {
                stats.completed_builds += 1;
            } else {
                stats.queued_tasks += build.num_queued_tasks() as u64;
                stats.running_tasks += build.num_running_tasks() as u64;
            }
        }
        stats
    }

    fn add_observer(&self, observer: Arc<dyn SchedulerObserver>) {
        write_lock(&self.observers).push(observer);
    }
}

impl SchedulerObserver for PriorityScheduler {
    fn task_scheduled(&self, task: &Task) {
        for observer in self.observers().iter() {
            observer.task_scheduled(task);
        }
    }

    fn task_status_changed(&self, task: &Task, status: TaskStatus) {
        self.metrics.record_task_status(status);
        for observer in self.observers().iter() {
            observer.task_status_changed(task, status);
        }
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("PriorityScheduler")
            .field("builds", &state.builds.len())
            .field("workers", &state.workers.len())
            .field("available", &state.available.len())
            .field("ready", &state.ready.len())
            .finish()
    }
}
