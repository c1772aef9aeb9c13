//! Prometheus exposition of scheduler statistics.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use buildq_scheduler::Statistics;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::api_error;
use crate::state::AppState;

/// Scheduler series registered once and refreshed from [`Statistics`] on
/// every scrape.
pub struct SchedulerMetrics {
    registry: Registry,
    builds: IntGauge,
    builds_total: IntCounter,
    tasks_queued: IntGauge,
    tasks_running: IntGauge,
    tasks_failed_total: IntCounter,
    tasks_passed_total: IntCounter,
    tasks_total: IntCounter,
    workers: IntGauge,
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let builds = IntGauge::new(
            "buildq_scheduler_builds",
            "The total number of builds currently running.",
        )?;
        let builds_total = IntCounter::new(
            "buildq_scheduler_builds_total",
            "The total number of completed builds.",
        )?;
        let tasks_queued = IntGauge::new(
            "buildq_scheduler_tasks_queued",
            "The total number of tasks currently queued.",
        )?;
        let tasks_running = IntGauge::new(
            "buildq_scheduler_tasks_running",
            "The total number of tasks currently running.",
        )?;
        let tasks_failed_total = IntCounter::new(
            "buildq_scheduler_tasks_failed_total",
            "The total number of failed tasks.",
        )?;
        let tasks_passed_total = IntCounter::new(
            "buildq_scheduler_tasks_passed_total",
            "The total number of successful tasks.",
        )?;
        let tasks_total = IntCounter::new(
            "buildq_scheduler_tasks_total",
            "The total number of completed tasks.",
        )?;
        let workers = IntGauge::new(
            "buildq_scheduler_workers",
            "The total number of workers currently connected.",
        )?;

        registry.register(Box::new(builds.clone()))?;
        registry.register(Box::new(builds_total.clone()))?;
        registry.register(Box::new(tasks_queued.clone()))?;
        registry.register(Box::new(tasks_running.clone()))?;
        registry.register(Box::new(tasks_failed_total.clone()))?;
        registry.register(Box::new(tasks_passed_total.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(workers.clone()))?;

        Ok(Self {
            registry,
            builds,
            builds_total,
            tasks_queued,
            tasks_running,
            tasks_failed_total,
            tasks_passed_total,
            tasks_total,
            workers,
        })
    }

    /// Bring every series in line with `stats`.
    pub fn update(&self, stats: &Statistics) {
        self.builds.set(gauge_value(stats.builds));
        self.tasks_queued.set(gauge_value(stats.queued_tasks));
        self.tasks_running.set(gauge_value(stats.running_tasks));
        self.workers.set(gauge_value(stats.workers));

        advance(&self.builds_total, stats.completed_builds);
        advance(&self.tasks_failed_total, stats.failed_tasks);
        advance(&self.tasks_passed_total, stats.successful_tasks);
        advance(&self.tasks_total, stats.completed_tasks);
    }

    /// Update from `stats` and encode the registry in the text format.
    /// Returns the content type together with the body.
    pub fn render(&self, stats: &Statistics) -> Result<(String, Vec<u8>), prometheus::Error> {
        self.update(stats);
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// Counters only move forward; the scheduler totals are monotonic.
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

pub async fn metrics(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (content_type, body) = state
        .metrics
        .render(&state.scheduler.statistics())
        .map_err(|e| api_error(buildq_core::Error::Internal(e.to_string())))?;
    Ok(([(header::CONTENT_TYPE, content_type)], body))
}
