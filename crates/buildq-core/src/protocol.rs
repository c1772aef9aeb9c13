//! Messages exchanged with clients, workers, and executors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{BuildId, WorkerId};
use crate::platform::Platform;
use crate::Result;

/// A task as declared by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Stable content hash of the task.
    pub identity: String,
    /// Per-attempt id used to correlate logs. Generated when empty.
    #[serde(default)]
    pub instance: String,
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
}

/// Everything a worker needs to run a build. The scheduler only reads `tasks`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskDescriptor>,
    /// Client-specific payload passed through to workers untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub client: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub environment: BuildEnvironment,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub logstream: bool,
}

impl BuildRequest {
    /// Content address of the request.
    pub fn digest(&self) -> Result<BuildId> {
        Ok(BuildId::digest(&serde_json::to_vec(self)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Accepted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildUpdate {
    pub status: BuildStatus,
    pub build_id: BuildId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Cancelled,
    Passed,
    Failed,
    Error,
    Skipped,
    Uploaded,
    Downloaded,
    Unstable,
}

impl TaskStatus {
    /// True once the task is no longer in progress.
    pub fn is_completed(&self) -> bool {
        !matches!(
            self,
            TaskStatus::Created | TaskStatus::Queued | TaskStatus::Running
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, TaskStatus::Queued)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Error | TaskStatus::Unstable
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TaskStatus::Passed | TaskStatus::Skipped | TaskStatus::Uploaded | TaskStatus::Downloaded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub build_id: BuildId,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAllocation {
    pub id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Stdout,
    Stderr,
    Info,
    Warning,
    Error,
    Exception,
    Debug,
    Verbose,
}

impl LogLevel {
    /// Split a `[  LEVEL] message` line into its level and message.
    /// Lines without a recognised prefix are stdout.
    pub fn split_prefix(line: &str) -> (LogLevel, &str) {
        const PREFIXES: [(&str, LogLevel); 8] = [
            ("[  ERROR]", LogLevel::Error),
            ("[WARNING]", LogLevel::Warning),
            ("[VERBOSE]", LogLevel::Verbose),
            ("[  DEBUG]", LogLevel::Debug),
            ("[   INFO]", LogLevel::Info),
            ("[ EXCEPT]", LogLevel::Exception),
            ("[ STDERR]", LogLevel::Stderr),
            ("[ STDOUT]", LogLevel::Stdout),
        ];
        for (prefix, level) in PREFIXES {
            if let Some(rest) = line.strip_prefix(prefix) {
                return (level, rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        (LogLevel::Stdout, line)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Stdout => "STDOUT",
            LogLevel::Stderr => "STDERR",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Exception => "EXCEPT",
            LogLevel::Debug => "DEBUG",
            LogLevel::Verbose => "VERBOSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub message: String,
    /// Identity of the task that produced the line.
    #[serde(default)]
    pub context: String,
}

impl LogLine {
    pub fn new(level: LogLevel, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            level,
            time: Utc::now(),
            message: message.into(),
            context: context.into(),
        }
    }

    /// Parse a worker-formatted line carrying a level prefix.
    pub fn parse(line: &str, context: impl Into<String>) -> Self {
        let (level, message) = LogLevel::split_prefix(line);
        Self::new(level, message, context)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    pub message: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub request: TaskRequest,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerAllocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loglines: Vec<LogLine>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TaskError>,
}

impl TaskUpdate {
    pub fn new(request: TaskRequest, status: TaskStatus) -> Self {
        Self {
            request,
            status,
            worker: None,
            loglines: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Status reported by a worker on its instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Enlisting,
    BuildEnded,
    DeployFailed,
    ExecutorFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    pub message: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    pub status: WorkerStatus,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub task_platform: Option<Platform>,
    #[serde(default)]
    pub error: Option<WorkerError>,
}

impl WorkerUpdate {
    pub fn enlist(platform: Platform, task_platform: Platform) -> Self {
        Self {
            status: WorkerStatus::Enlisting,
            platform: Some(platform),
            task_platform: Some(task_platform),
            error: None,
        }
    }

    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status,
            platform: None,
            task_platform: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    Build,
    CancelBuild,
}

/// Instruction sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub action: WorkerAction,
    pub build_id: BuildId,
    pub worker_id: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BuildEnvironment>,
}

/// First message on an executor stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorEnlist {
    pub worker_id: WorkerId,
    pub build_id: BuildId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(priority: i32) -> BuildRequest {
        let mut tasks = BTreeMap::new();
        tasks.insert(
            "t1".to_string(),
            TaskDescriptor {
                identity: "t1".to_string(),
                instance: String::new(),
                name: "compile".to_string(),
                platform: Platform::new(),
            },
        );
        BuildRequest {
            environment: BuildEnvironment {
                tasks,
                client: serde_json::Value::Null,
            },
            priority,
            logstream: false,
        }
    }

    #[test]
    fn test_task_status_is_completed() {
        let cases = [
            (TaskStatus::Created, false),
            (TaskStatus::Queued, false),
            (TaskStatus::Running, false),
            (TaskStatus::Cancelled, true),
            (TaskStatus::Passed, true),
            (TaskStatus::Failed, true),
            (TaskStatus::Error, true),
            (TaskStatus::Skipped, true),
            (TaskStatus::Uploaded, true),
            (TaskStatus::Downloaded, true),
            (TaskStatus::Unstable, true),
        ];
        for (status, completed) in cases {
            assert_eq!(status.is_completed(), completed, "{status:?}");
        }
    }

    #[test]
    fn test_build_digest_dedupes_identical_requests() {
        assert_eq!(request(1).digest().unwrap(), request(1).digest().unwrap());
        assert_ne!(request(1).digest().unwrap(), request(2).digest().unwrap());
    }

    #[test]
    fn test_log_prefix_parsing() {
        let line = LogLine::parse("[  ERROR] boom", "t1");
        assert_eq!(line.level, LogLevel::Error);
        assert_eq!(line.message, "boom");

        let line = LogLine::parse("[   INFO] hello", "t1");
        assert_eq!(line.level, LogLevel::Info);

        let line = LogLine::parse("plain", "t1");
        assert_eq!(line.level, LogLevel::Stdout);
        assert_eq!(line.message, "plain");
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::Downloaded).unwrap();
        assert_eq!(json, "\"downloaded\"");
        let update: WorkerUpdate = serde_json::from_str(r#"{"status":"build_ended"}"#).unwrap();
        assert_eq!(update, WorkerUpdate::status(WorkerStatus::BuildEnded));
    }
}
