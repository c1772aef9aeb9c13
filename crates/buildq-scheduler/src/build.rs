//! Builds: a client request, its tasks, and the queue of runnable tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use buildq_core::ids::BuildId;
use buildq_core::platform::Platform;
use buildq_core::protocol::{BuildEnvironment, BuildRequest, BuildStatus, BuildUpdate, TaskStatus};
use buildq_core::{Error, Result};
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::broadcast::{Broadcast, BroadcastConsumer};
use crate::executor::TaskExecutor;
use crate::sync::{read_lock, write_lock};
use crate::task::{Task, TaskUpdateObserver};
use crate::unicast::{Unicast, UnicastCallbacks};
use crate::worker::Worker;

/// Queue of runnable tasks, consumed by executors on behalf of workers.
pub type TaskQueue = Unicast<Arc<Task>, Arc<dyn Worker>>;

/// Receives the status updates of one build.
pub type BuildUpdateObserver = BroadcastConsumer<BuildUpdate>;

// Submission order, breaks ties between equal timestamps.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Matches tasks to workers in both directions: the worker must offer what
/// the task requires, and the task must carry what the worker demands.
struct TaskSelection {
    cancelled: Arc<AtomicBool>,
}

impl UnicastCallbacks<Arc<Task>, Arc<dyn Worker>> for TaskSelection {
    fn select(&self, task: &Arc<Task>, worker: &Arc<dyn Worker>) -> bool {
        !self.cancelled.load(Ordering::Acquire)
            && !task.is_completed()
            && !task.is_assigned()
            && worker.platform().fulfills(task.platform())
            && task.platform().fulfills(worker.task_platform())
    }

    fn selected(&self, task: &Arc<Task>, worker: &Arc<dyn Worker>) {
        task.assign_to_worker(worker.id());
        task.set_matched_platform(worker.platform().clone());
    }

    fn not_selected(&self, task: &Arc<Task>, worker: &Arc<dyn Worker>) {
        debug!(task_id = %task.identity(), worker_id = %worker.id(), "Task returned to queue");
        task.unassign();
        if !self.cancelled.load(Ordering::Acquire) {
            task.post_status_update(TaskStatus::Queued);
        }
    }
}

struct BuildState {
    environment: Option<Arc<BuildEnvironment>>,
    tasks: HashMap<String, Arc<Task>>,
    queue: Option<Arc<TaskQueue>>,
}

pub struct Build {
    id: BuildId,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    sequence: u64,
    logstream: bool,
    cancelled: Arc<AtomicBool>,
    token: CancellationToken,
    observers: Broadcast<BuildUpdate>,
    state: RwLock<BuildState>,
}

impl Build {
    /// Create a build and one task per declared task. No scheduler state
    /// is touched.
    pub fn new(id: BuildId, request: BuildRequest) -> Arc<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let queue = Unicast::new(Arc::new(TaskSelection {
            cancelled: Arc::clone(&cancelled),
        }));

        let tasks = request
            .environment
            .tasks
            .values()
            .map(|descriptor| {
                let task = Task::new(id.clone(), request.logstream, descriptor);
                (descriptor.identity.clone(), Arc::new(task))
            })
            .collect();

        Arc::new(Self {
            id,
            priority: request.priority,
            scheduled_at: Utc::now(),
            sequence: SEQUENCE.fetch_add(1, Ordering::Relaxed),
            logstream: request.logstream,
            cancelled,
            token: CancellationToken::new(),
            observers: Broadcast::new(),
            state: RwLock::new(BuildState {
                environment: Some(Arc::new(request.environment)),
                tasks,
                queue: Some(Arc::new(queue)),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BuildState> {
        read_lock(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BuildState> {
        write_lock(&self.state)
    }

    fn queue(&self) -> Option<Arc<TaskQueue>> {
        self.read().queue.clone()
    }

    pub fn id(&self) -> &BuildId {
        &self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// Monotonic submission counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn logstream_enabled(&self) -> bool {
        self.logstream
    }

    /// `None` once the build is closed.
    pub fn environment(&self) -> Option<Arc<BuildEnvironment>> {
        self.read().environment.clone()
    }

    pub fn status(&self) -> BuildStatus {
        if self.is_cancelled() {
            BuildStatus::Cancelled
        } else {
            BuildStatus::Accepted
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.status() != BuildStatus::Accepted
    }

    /// Resolves when the build is cancelled or closed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn task(&self, identity: &str) -> Option<Arc<Task>> {
        self.read().tasks.get(identity).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.read().tasks.values().cloned().collect()
    }

    pub fn queued_tasks(&self) -> Vec<Arc<Task>> {
        self.queue().map(|q| q.pending()).unwrap_or_default()
    }

    pub fn running_tasks(&self) -> Vec<Arc<Task>> {
        self.queue().map(|q| q.unacked()).unwrap_or_default()
    }

    /// First queued task matching `pred`, in queue order.
    pub fn find_queued_task<F>(&self, pred: F) -> Option<Arc<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        self.queue()?.find(|task| pred(task.as_ref()))
    }

    pub fn num_queued_tasks(&self) -> usize {
        self.queue().map(|q| q.len()).unwrap_or(0)
    }

    pub fn num_running_tasks(&self) -> usize {
        self.queue().map(|q| q.num_unacked_data()).unwrap_or(0)
    }

    pub fn has_queued_task(&self) -> bool {
        self.num_queued_tasks() > 0
    }

    pub fn has_running_task(&self) -> bool {
        self.queue().map(|q| q.has_unacked_data()).unwrap_or(false)
    }

    /// True if a client is watching the build or one of its queued tasks.
    pub fn has_observer(&self) -> bool {
        self.observers.has_consumer()
            || self
                .find_queued_task(|task| task.has_observer())
                .is_some()
    }

    /// True once nothing can progress: no queued or running work and
    /// nobody watching, or cancelled with nothing left running.
    pub fn is_terminal(&self) -> bool {
        let queued = self.has_queued_task();
        let running = self.has_running_task();
        let observed = self.has_observer();
        (!queued && !running && !observed) || (self.is_cancelled() && !running)
    }

    /// Queue a task for execution and start observing it.
    ///
    /// Tasks that already finished are reset to QUEUED so that the new
    /// observer sees them run again.
    pub fn schedule_task(&self, identity: &str) -> Result<(Arc<Task>, TaskUpdateObserver)> {
        if self.is_cancelled() {
            return Err(Error::TerminalBuild(format!("build {} is cancelled", self.id)));
        }

        let (task, queue) = {
            let state = self.read();
            let task = state
                .tasks
                .get(identity)
                .cloned()
                .ok_or_else(|| Error::task_not_found(identity))?;
            let queue = state
                .queue
                .clone()
                .ok_or_else(|| Error::TerminalBuild(format!("build {} is closed", self.id)))?;
            (task, queue)
        };

        let status = task.status();
        if !matches!(status, TaskStatus::Queued | TaskStatus::Running) {
            if status.is_completed() {
                task.unassign();
            }
            task.post_status_update(TaskStatus::Queued);
        }

        let observer = task.new_update_observer();
        queue.send(Arc::clone(&task));
        Ok((task, observer))
    }

    /// Cancel a task that has not started. Returns false if it was running
    /// or already finished.
    pub fn cancel_task(&self, identity: &str) -> Result<bool> {
        let task = self
            .task(identity)
            .ok_or_else(|| Error::task_not_found(identity))?;
        let cancelled = task.cancel();
        if cancelled {
            if let Some(queue) = self.queue() {
                queue.remove(&task);
            }
        }
        Ok(cancelled)
    }

    /// Cancel every task that has not started and flag the build cancelled.
    /// Running tasks keep going until their executor reports back.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(build_id = %self.id, "Build cancelled");

        for task in self.tasks() {
            task.cancel();
        }
        self.observers.send(BuildUpdate {
            status: BuildStatus::Cancelled,
            build_id: self.id.clone(),
        });
        self.token.cancel();
    }

    /// Release everything the build holds. Observers see their stream end.
    pub fn close(&self) {
        self.token.cancel();
        self.observers.close();

        let (tasks, queue) = {
            let mut state = self.write();
            state.environment = None;
            let tasks: Vec<Arc<Task>> = state.tasks.drain().map(|(_, task)| task).collect();
            (tasks, state.queue.take())
        };

        for task in tasks {
            task.close();
        }
        if let Some(queue) = queue {
            queue.close();
        }
    }

    /// Bind `worker` to this build if some queued task is eligible for it.
    /// The eligible task is delivered to the returned executor right away.
    pub fn new_executor(&self, worker: Arc<dyn Worker>) -> Result<TaskExecutor> {
        if self.is_cancelled() {
            return Err(Error::TerminalBuild(format!("build {} is cancelled", self.id)));
        }
        let queue = self
            .queue()
            .ok_or_else(|| Error::TerminalBuild(format!("build {} is closed", self.id)))?;

        let worker_id = worker.id();
        let platform: Platform = worker.platform().clone();
        let consumer = queue.new_consumer_with_item(worker)?;
        Ok(TaskExecutor::new(self.id.clone(), worker_id, platform, consumer))
    }

    pub fn new_update_observer(&self) -> BuildUpdateObserver {
        self.observers.new_consumer()
    }
}

impl PartialEq for Build {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for Build {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Build")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("scheduled_at", &self.scheduled_at)
            .field("status", &self.status())
            .finish()
    }
}
