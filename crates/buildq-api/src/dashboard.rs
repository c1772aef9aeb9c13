//! Task telemetry for an external dashboard.

use std::sync::Arc;

use buildq_core::protocol::TaskStatus;
use buildq_scheduler::{SchedulerObserver, Task};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 1000;

/// Event body accepted by the dashboard's `/api/v1/tasks` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub event: &'static str,
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub routing_key: String,
    pub identity: String,
    pub instance: String,
    pub name: String,
    pub role: &'static str,
    pub log: String,
}

/// Observer that posts task events to a dashboard from a background task.
/// Events are dropped, not queued, when the dashboard falls behind.
pub struct DashboardObserver {
    tx: mpsc::Sender<TaskEvent>,
    log_uri: String,
}

impl DashboardObserver {
    /// Spawn the posting task. `log_uri` is the public base URL that serves
    /// `/logs/{instance}`.
    pub fn spawn(dashboard_uri: &str, log_uri: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let endpoint = format!("{}/api/v1/tasks", dashboard_uri.trim_end_matches('/'));
        tokio::spawn(post_events(reqwest::Client::new(), endpoint, rx));
        Arc::new(Self {
            tx,
            log_uri: log_uri.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn format_event(&self, task: &Task, status: TaskStatus) -> Option<TaskEvent> {
        let (event, with_log) = match status {
            TaskStatus::Queued => ("queued", false),
            TaskStatus::Cancelled => ("cancelled", false),
            TaskStatus::Running => ("started", true),
            status if status.is_failure() => ("failed", true),
            status if status.is_success() => ("finished", true),
            _ => return None,
        };

        let routing_key = task
            .platform()
            .properties_for_key("label")
            .map(|labels| labels.join(","))
            .unwrap_or_default();
        let hostname = task
            .matched_platform()
            .and_then(|platform| platform.hostname().map(str::to_string))
            .unwrap_or_default();
        let log = if with_log {
            format!("{}/logs/{}", self.log_uri, task.instance())
        } else {
            String::new()
        };

        Some(TaskEvent {
            event,
            hostname,
            routing_key,
            identity: task.identity().to_string(),
            instance: task.instance().to_string(),
            name: task.name().to_string(),
            role: "scheduler",
            log,
        })
    }
}

impl SchedulerObserver for DashboardObserver {
    fn task_scheduled(&self, task: &Task) {
        self.task_status_changed(task, TaskStatus::Queued);
    }

    fn task_status_changed(&self, task: &Task, status: TaskStatus) {
        let Some(event) = self.format_event(task, status) else {
            return;
        };
        if self.tx.try_send(event).is_err() {
            debug!(task_id = %task.identity(), "Dashboard telemetry channel full");
        }
    }
}

async fn post_events(client: reqwest::Client, endpoint: String, mut rx: mpsc::Receiver<TaskEvent>) {
    while let Some(event) = rx.recv().await {
        match client.post(&endpoint).json(&event).send().await {
            Ok(response) if !response.status().is_success() => {
                trace!(status = %response.status(), "Dashboard rejected telemetry");
            }
            Ok(_) => {}
            Err(err) => trace!(error = %err, "Failed to post telemetry"),
        }
    }
}
