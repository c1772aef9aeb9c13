//! Task state machine and update fan-out.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use buildq_core::ids::{BuildId, WorkerId, new_instance_id};
use buildq_core::platform::Platform;
use buildq_core::protocol::{TaskDescriptor, TaskRequest, TaskStatus, TaskUpdate};
use tracing::debug;

use crate::broadcast::{Broadcast, BroadcastConsumer};
use crate::scheduler::SchedulerObserver;
use crate::sync::{read_lock, write_lock};

/// Receives the updates of one task. `None` means the task was closed.
pub type TaskUpdateObserver = BroadcastConsumer<TaskUpdate>;

struct TaskState {
    status: TaskStatus,
    matched_platform: Option<Platform>,
    worker: Option<WorkerId>,
    hooks: Option<Weak<dyn SchedulerObserver>>,
}

pub struct Task {
    identity: String,
    instance: String,
    name: String,
    platform: Platform,
    build_id: BuildId,
    logstream: bool,
    state: RwLock<TaskState>,
    observers: Broadcast<TaskUpdate>,
}

impl Task {
    pub fn new(build_id: BuildId, logstream: bool, descriptor: &TaskDescriptor) -> Self {
        let instance = if descriptor.instance.is_empty() {
            new_instance_id()
        } else {
            descriptor.instance.clone()
        };
        Self {
            identity: descriptor.identity.clone(),
            instance,
            name: descriptor.name.clone(),
            platform: descriptor.platform.clone(),
            build_id,
            logstream,
            state: RwLock::new(TaskState {
                status: TaskStatus::Created,
                matched_platform: None,
                worker: None,
                hooks: None,
            }),
            observers: Broadcast::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TaskState> {
        read_lock(&self.state)
    }

    fn write(&self) -> RwLockWriteGuard<'_, TaskState> {
        write_lock(&self.state)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Properties a worker must offer to run this task.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            build_id: self.build_id.clone(),
            task_id: self.identity.clone(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    pub fn is_completed(&self) -> bool {
        self.status().is_completed()
    }

    /// Platform of the worker the task was last dispatched to.
    pub fn matched_platform(&self) -> Option<Platform> {
        self.read().matched_platform.clone()
    }

    pub fn set_matched_platform(&self, platform: Platform) {
        self.write().matched_platform = Some(platform);
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        self.read().worker
    }

    pub fn is_assigned(&self) -> bool {
        self.read().worker.is_some()
    }

    pub fn assign_to_worker(&self, worker: WorkerId) {
        self.write().worker = Some(worker);
    }

    pub fn unassign(&self) {
        self.write().worker = None;
    }

    /// Install the hook notified of every status transition.
    pub fn set_scheduler(&self, hooks: Weak<dyn SchedulerObserver>) {
        self.write().hooks = Some(hooks);
    }

    pub fn has_observer(&self) -> bool {
        self.observers.has_consumer()
    }

    pub fn new_update_observer(&self) -> TaskUpdateObserver {
        self.observers.new_consumer()
    }

    /// Apply the status carried by `update` and forward it to observers.
    ///
    /// With log streaming, updates carrying log lines are forwarded even
    /// without a status change, stamped with the current status. Without it,
    /// only transitions are forwarded and log lines are stripped.
    /// Returns true if the status changed.
    pub fn post_update(&self, mut update: TaskUpdate) -> bool {
        let changed = self.set_status(update.status);
        if self.logstream {
            if !changed {
                if update.loglines.is_empty() {
                    return false;
                }
                update.status = self.status();
            }
            self.observers.send(update);
        } else if changed {
            update.loglines.clear();
            self.observers.send(update);
        }
        changed
    }

    pub fn post_status_update(&self, status: TaskStatus) -> bool {
        self.post_update(TaskUpdate::new(self.request(), status))
    }

    fn set_status(&self, status: TaskStatus) -> bool {
        let hooks = {
            let mut state = self.write();
            if !transition_allowed(state.status, status) {
                if state.status != status {
                    debug!(
                        task_id = %self.identity,
                        status = ?state.status,
                        rejected = ?status,
                        "Task status change rejected"
                    );
                }
                return false;
            }
            state.status = status;
            state.hooks.clone()
        };

        if let Some(hooks) = hooks.and_then(|h| h.upgrade()) {
            hooks.task_status_changed(self, status);
        }
        true
    }

    /// Move to CANCELLED if still created or queued.
    pub fn cancel(&self) -> bool {
        self.post_status_update(TaskStatus::Cancelled)
    }

    /// Cancel and end every observer stream.
    pub fn close(&self) {
        self.cancel();
        self.observers.close();
    }
}

/// Allowed moves of the task state machine.
///
/// Reposting the current status is never a transition. CANCELLED is only
/// reachable before the task runs. Finished tasks may only be requeued.
fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return false;
    }
    if to == TaskStatus::Cancelled && !matches!(from, TaskStatus::Created | TaskStatus::Queued) {
        return false;
    }
    match from {
        TaskStatus::Created | TaskStatus::Queued | TaskStatus::Running => true,
        _ => to == TaskStatus::Queued,
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.build_id == other.build_id
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("identity", &self.identity)
            .field("instance", &self.instance)
            .field("name", &self.name)
            .field("build_id", &self.build_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_core::protocol::{LogLevel, LogLine};
    use std::sync::Arc;
    use std::sync::Mutex;

    fn task(logstream: bool) -> Task {
        let descriptor = TaskDescriptor {
            identity: "t1".to_string(),
            instance: String::new(),
            name: "compile".to_string(),
            platform: Platform::new(),
        };
        Task::new(BuildId::digest(b"build"), logstream, &descriptor)
    }

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<TaskStatus>>,
    }

    impl SchedulerObserver for Recorder {
        fn task_scheduled(&self, _task: &Task) {}

        fn task_status_changed(&self, _task: &Task, status: TaskStatus) {
            self.changes.lock().unwrap().push(status);
        }
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        let all = [
            Created, Queued, Running, Cancelled, Passed, Failed, Error, Skipped, Uploaded,
            Downloaded, Unstable,
        ];
        for from in all {
            for to in all {
                let expected = if from == to {
                    false
                } else if to == Cancelled {
                    matches!(from, Created | Queued)
                } else if matches!(from, Created | Queued | Running) {
                    true
                } else {
                    to == Queued
                };
                assert_eq!(transition_allowed(from, to), expected, "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn test_instance_generated_when_missing() {
        let t = task(false);
        assert!(!t.instance().is_empty());
        assert_eq!(t.status(), TaskStatus::Created);
    }

    #[tokio::test]
    async fn test_same_status_notifies_once() {
        let t = task(false);
        let mut observer = t.new_update_observer();

        assert!(t.post_status_update(TaskStatus::Queued));
        assert!(!t.post_status_update(TaskStatus::Queued));

        assert_eq!(observer.recv().await.map(|u| u.status), Some(TaskStatus::Queued));
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_is_noop() {
        let t = task(false);
        t.post_status_update(TaskStatus::Running);
        assert!(!t.cancel());
        assert_eq!(t.status(), TaskStatus::Running);

        t.post_status_update(TaskStatus::Passed);
        assert!(!t.cancel());
        assert_eq!(t.status(), TaskStatus::Passed);
    }

    #[tokio::test]
    async fn test_terminal_can_only_requeue() {
        let t = task(false);
        t.post_status_update(TaskStatus::Running);
        t.post_status_update(TaskStatus::Failed);
        assert!(!t.post_status_update(TaskStatus::Running));
        assert!(t.post_status_update(TaskStatus::Queued));
        assert_eq!(t.status(), TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_loglines_stripped_without_logstream() {
        let t = task(false);
        let mut observer = t.new_update_observer();

        let mut update = TaskUpdate::new(t.request(), TaskStatus::Running);
        update.loglines.push(LogLine::new(LogLevel::Info, "hi", "t1"));
        assert!(t.post_update(update.clone()));
        // Same status with logs: nothing forwarded.
        assert!(!t.post_update(update));

        let received = observer.recv().await.unwrap();
        assert!(received.loglines.is_empty());
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_logstream_forwards_lines_with_current_status() {
        let t = task(true);
        let mut observer = t.new_update_observer();
        t.post_status_update(TaskStatus::Running);

        let mut update = TaskUpdate::new(t.request(), TaskStatus::Queued);
        update.status = TaskStatus::Running;
        update.loglines.push(LogLine::new(LogLevel::Info, "line", "t1"));
        assert!(!t.post_update(update));

        // Same status and no lines: dropped.
        assert!(!t.post_status_update(TaskStatus::Running));

        assert_eq!(observer.recv().await.unwrap().status, TaskStatus::Running);
        let with_lines = observer.recv().await.unwrap();
        assert_eq!(with_lines.status, TaskStatus::Running);
        assert_eq!(with_lines.loglines.len(), 1);
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_hooks_see_each_transition() {
        let t = task(false);
        let recorder = Arc::new(Recorder::default());
        let hooks: Arc<dyn SchedulerObserver> = recorder.clone();
        t.set_scheduler(Arc::downgrade(&hooks));

        t.post_status_update(TaskStatus::Queued);
        t.post_status_update(TaskStatus::Queued);
        t.post_status_update(TaskStatus::Running);
        t.post_status_update(TaskStatus::Passed);

        assert_eq!(
            *recorder.changes.lock().unwrap(),
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Passed]
        );
    }

    #[tokio::test]
    async fn test_close_cancels_and_ends_observers() {
        let t = task(false);
        let mut observer = t.new_update_observer();
        t.post_status_update(TaskStatus::Queued);
        t.close();

        assert_eq!(observer.recv().await.unwrap().status, TaskStatus::Queued);
        assert_eq!(observer.recv().await.unwrap().status, TaskStatus::Cancelled);
        assert!(observer.recv().await.is_none());
        assert!(!t.has_observer());
    }
}
