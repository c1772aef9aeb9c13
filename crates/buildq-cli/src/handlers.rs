//! Command handlers for the administration commands.

use anyhow::Result;
use buildq_scheduler::{BuildInfo, TaskInfo, WorkerInfo};
use console::style;
use serde::Serialize;

use crate::client::ApiClient;
use crate::commands::OutputFormat;

/// List builds.
pub async fn list_builds(client: &ApiClient, output: OutputFormat, tasks: bool) -> Result<()> {
    let response = client.list_builds(tasks).await?;
    match output {
        OutputFormat::Table => print!("{}", format_builds(&response.builds)),
        _ => print_structured(output, &response)?,
    }
    Ok(())
}

/// List workers.
pub async fn list_workers(client: &ApiClient, output: OutputFormat) -> Result<()> {
    let response = client.list_workers().await?;
    match output {
        OutputFormat::Table => print!("{}", format_workers(&response.workers)),
        _ => print_structured(output, &response)?,
    }
    Ok(())
}

pub async fn cancel(client: &ApiClient, build_id: &str) -> Result<()> {
    client.cancel_build(build_id).await?;
    println!("{} Build {} cancelled", style("✓").green(), short(build_id));
    Ok(())
}

pub async fn reschedule(client: &ApiClient) -> Result<()> {
    client.reschedule().await?;
    println!("{} Rescheduling requested", style("✓").green());
    Ok(())
}

pub async fn logs(client: &ApiClient, instance: &str) -> Result<()> {
    print!("{}", client.get_log(instance).await?);
    Ok(())
}

fn print_structured<T: Serialize>(output: OutputFormat, value: &T) -> Result<()> {
    match output {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

pub fn format_builds(builds: &[BuildInfo]) -> String {
    if builds.is_empty() {
        return "No builds\n".to_string();
    }
    let mut out = format!(
        "{:<12}  {:<9}  {:>8}  {:<5}  {:<7}  {:<7}  {}\n",
        "BUILD", "STATUS", "PRIORITY", "READY", "QUEUED", "RUNNING", "SCHEDULED"
    );
    for build in builds {
        out.push_str(&format!(
            "{:<12}  {:<9}  {:>8}  {:<5}  {:<7}  {:<7}  {}\n",
            short(build.id.as_str()),
            format!("{:?}", build.status).to_lowercase(),
            build.priority,
            yes_no(build.ready),
            yes_no(build.has_queued_task),
            yes_no(build.has_running_task),
            build.scheduled_at.format("%Y-%m-%d %H:%M:%S"),
        ));
        for task in build.tasks.iter().flatten() {
            out.push_str(&format_task(task));
        }
    }
    out
}

fn format_task(task: &TaskInfo) -> String {
    let worker = task
        .worker
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  - {:<24} {:<10} {}  {}\n",
        task.name,
        format!("{:?}", task.status).to_lowercase(),
        task.instance,
        worker
    )
}

pub fn format_workers(workers: &[WorkerInfo]) -> String {
    if workers.is_empty() {
        return "No workers\n".to_string();
    }
    let mut out = format!(
        "{:<40}  {:<20}  {:<9}  {:<12}  {}\n",
        "WORKER", "HOST", "AVAILABLE", "BUILD", "TASK"
    );
    for worker in workers {
        out.push_str(&format!(
            "{:<40}  {:<20}  {:<9}  {:<12}  {}\n",
            worker.id,
            worker.platform.hostname().unwrap_or("-"),
            yes_no(worker.available),
            worker
                .current_build
                .as_ref()
                .map(|id| short(id.as_str()))
                .unwrap_or("-"),
            worker
                .current_task
                .as_ref()
                .map(|task| task.name.as_str())
                .unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_core::ids::{BuildId, WorkerId};
    use buildq_core::platform::Platform;
    use buildq_core::protocol::{BuildStatus, TaskStatus};
    use chrono::Utc;

    #[test]
    fn test_format_builds_with_tasks() {
        let worker = WorkerId::new();
        let build = BuildInfo {
            id: BuildId::digest(b"build"),
            status: BuildStatus::Accepted,
            priority: 5,
            scheduled_at: Utc::now(),
            tasks: Some(vec![TaskInfo {
                id: "abc".to_string(),
                instance: "inst-1".to_string(),
                name: "compile".to_string(),
                status: TaskStatus::Running,
                worker: Some(worker),
            }]),
            has_observer: true,
            has_running_task: true,
            has_queued_task: false,
            ready: false,
        };
        let text = format_builds(&[build.clone()]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("BUILD"));
        assert!(lines[1].starts_with(short(build.id.as_str())));
        assert!(lines[1].contains("accepted"));
        assert!(lines[2].contains("compile"));
        assert!(lines[2].contains("running"));
        assert!(lines[2].ends_with(&worker.to_string()));
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_builds(&[]), "No builds\n");
        assert_eq!(format_workers(&[]), "No workers\n");
    }

    #[test]
    fn test_format_workers() {
        let mut platform = Platform::new();
        platform.add_property("worker.hostname", "builder-7");
        let worker = WorkerInfo {
            id: WorkerId::new(),
            platform,
            task_platform: Platform::new(),
            available: true,
            current_build: None,
            current_task: None,
        };
        let text = format_workers(&[worker]);
        let row = text.lines().nth(1).unwrap();
        assert!(row.contains("builder-7"));
        assert!(row.contains("yes"));
    }
}
