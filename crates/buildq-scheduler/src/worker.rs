//! Connected build hosts.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use buildq_core::ids::{BuildId, WorkerId};
use buildq_core::platform::Platform;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::build::Build;
use crate::priority::PriorityScheduler;
use crate::sync::lock;

/// A host that accepts whole builds and runs their tasks through executors.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Properties the worker offers. Includes `node.os`, `node.arch` and
    /// `worker.hostname` when enlisted with defaults.
    fn platform(&self) -> &Platform;

    /// Properties every task sent to this worker must carry.
    fn task_platform(&self) -> &Platform;

    /// Next build assigned by the scheduler, or `None` once closed.
    async fn next_build(&self) -> Option<Arc<Build>>;

    /// Hand a build to the worker. Never blocks.
    fn post(&self, build: Arc<Build>);

    /// The worker is done with its build and may take another.
    fn acknowledge(&self);

    /// Ask the worker to disconnect.
    fn cancel(&self);

    /// Unregister from the scheduler. Idempotent.
    fn close(&self);

    fn is_cancelled(&self) -> bool;

    async fn cancelled(&self);

    fn current_build(&self) -> Option<BuildId>;
}

/// Worker registered with a [`PriorityScheduler`].
pub struct PriorityWorker {
    id: WorkerId,
    platform: Platform,
    task_platform: Platform,
    scheduler: Weak<PriorityScheduler>,
    // Holds at most one build: a worker is busy until it acknowledges.
    tx: Mutex<Option<mpsc::Sender<Arc<Build>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Build>>>,
    token: CancellationToken,
    current: Mutex<Option<BuildId>>,
}

impl PriorityWorker {
    pub(crate) fn new(
        platform: Platform,
        task_platform: Platform,
        scheduler: Weak<PriorityScheduler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            id: WorkerId::new(),
            platform,
            task_platform,
            scheduler,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            token: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Arc<Build>>>> {
        lock(&self.tx)
    }

    fn current(&self) -> MutexGuard<'_, Option<BuildId>> {
        lock(&self.current)
    }

    /// Hostname if known, otherwise the id.
    pub fn display_name(&self) -> String {
        match self.platform.hostname() {
            Some(hostname) => hostname.to_string(),
            None => self.id.to_string(),
        }
    }
}

#[async_trait]
impl Worker for PriorityWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn task_platform(&self) -> &Platform {
        &self.task_platform
    }

    async fn next_build(&self) -> Option<Arc<Build>> {
        self.rx.lock().await.recv().await
    }

    fn post(&self, build: Arc<Build>) {
        let tx = self.sender();
        let Some(tx) = tx.as_ref() else {
            error!(worker_id = %self.id, build_id = %build.id(), "Build could not be delivered, worker is closed");
            return;
        };
        let build_id = build.id().clone();
        match tx.try_send(build) {
            Ok(()) => {
                *self.current() = Some(build_id);
            }
            Err(err) => {
                error!(worker_id = %self.id, build_id = %build_id, error = %err, "Build could not be delivered");
            }
        }
    }

    fn acknowledge(&self) {
        self.current().take();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.release_worker(self.id);
        }
    }

    fn cancel(&self) {
        debug!(worker_id = %self.id, "Worker cancelled");
        self.token.cancel();
    }

    fn close(&self) {
        self.token.cancel();
        if self.sender().take().is_none() {
            return;
        }
        self.current().take();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.remove_worker(self.id);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }

    fn current_build(&self) -> Option<BuildId> {
        self.current().clone()
    }
}

impl std::fmt::Debug for PriorityWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityWorker")
            .field("id", &self.id)
            .field("platform", &self.platform.to_string())
            .field("task_platform", &self.task_platform.to_string())
            .finish()
    }
}
