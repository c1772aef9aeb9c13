//! Executors: a worker's task channel for one build.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use buildq_core::ids::{BuildId, WorkerId};
use buildq_core::platform::Platform;
use tracing::debug;

use crate::build::Build;
use crate::priority::PriorityScheduler;
use crate::scheduler::Scheduler;
use crate::task::Task;
use crate::unicast::UnicastConsumer;
use crate::worker::Worker;

/// Receives the tasks of one build on behalf of one worker.
///
/// At most one task is outstanding. Acknowledge it once it reaches a
/// terminal status to receive the next one; closing without acknowledging
/// returns it to the build's queue.
#[async_trait]
pub trait Executor: Send + Sync {
    fn build_id(&self) -> &BuildId;

    fn worker_id(&self) -> WorkerId;

    /// Platform of the worker running the tasks.
    fn platform(&self) -> &Platform;

    /// Next task, or `None` once the executor is closed.
    async fn next_task(&self) -> Option<Arc<Task>>;

    fn try_next_task(&self) -> Option<Arc<Task>>;

    fn acknowledge(&self);

    /// The delivered task not yet acknowledged, if any.
    fn unacknowledged(&self) -> Option<Arc<Task>>;

    /// Unregister. Idempotent.
    fn close(&self);

    /// Resolves once the executor or its build's queue is closed.
    async fn cancelled(&self);
}

impl std::fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("build_id", self.build_id())
            .field("worker_id", &self.worker_id())
            .finish()
    }
}

/// Executor backed by a consumer of the build's task queue.
pub struct TaskExecutor {
    build_id: BuildId,
    worker_id: WorkerId,
    platform: Platform,
    consumer: UnicastConsumer<Arc<Task>, Arc<dyn Worker>>,
}

impl TaskExecutor {
    pub fn new(
        build_id: BuildId,
        worker_id: WorkerId,
        platform: Platform,
        consumer: UnicastConsumer<Arc<Task>, Arc<dyn Worker>>,
    ) -> Self {
        Self {
            build_id,
            worker_id,
            platform,
            consumer,
        }
    }
}

#[async_trait]
impl Executor for TaskExecutor {
    fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn next_task(&self) -> Option<Arc<Task>> {
        self.consumer.recv().await
    }

    fn try_next_task(&self) -> Option<Arc<Task>> {
        self.consumer.try_recv()
    }

    fn acknowledge(&self) {
        self.consumer.acknowledge();
    }

    fn unacknowledged(&self) -> Option<Arc<Task>> {
        self.consumer.unacknowledged()
    }

    fn close(&self) {
        self.consumer.close();
    }

    async fn cancelled(&self) {
        self.consumer.cancelled().await
    }
}

/// Executor handed out by the [`PriorityScheduler`]. Closing it puts the
/// build back in the ready queue if tasks are still waiting.
pub struct PriorityExecutor {
    inner: TaskExecutor,
    build: Arc<Build>,
    scheduler: Weak<PriorityScheduler>,
    closed: AtomicBool,
}

impl PriorityExecutor {
    pub(crate) fn new(
        inner: TaskExecutor,
        build: Arc<Build>,
        scheduler: Weak<PriorityScheduler>,
    ) -> Self {
        Self {
            inner,
            build,
            scheduler,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Executor for PriorityExecutor {
    fn build_id(&self) -> &BuildId {
        self.inner.build_id()
    }

    fn worker_id(&self) -> WorkerId {
        self.inner.worker_id()
    }

    fn platform(&self) -> &Platform {
        self.inner.platform()
    }

    async fn next_task(&self) -> Option<Arc<Task>> {
        self.inner.next_task().await
    }

    fn try_next_task(&self) -> Option<Arc<Task>> {
        self.inner.try_next_task()
    }

    fn acknowledge(&self) {
        self.inner.acknowledge();
    }

    fn unacknowledged(&self) -> Option<Arc<Task>> {
        self.inner.unacknowledged()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.close();
        debug!(build_id = %self.build.id(), worker_id = %self.inner.worker_id(), "Executor closed");

        if let Some(scheduler) = self.scheduler.upgrade() {
            if self.build.has_queued_task() {
                scheduler.enqueue_build(&self.build);
            }
            scheduler.reschedule();
        }
    }

    async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
