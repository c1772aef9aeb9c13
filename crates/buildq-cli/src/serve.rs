//! The `serve` command: scheduler loop plus HTTP/WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use buildq_api::dashboard::DashboardObserver;
use buildq_api::{AppState, create_router};
use buildq_core::logstash::MemoryLogStash;
use buildq_scheduler::{PriorityScheduler, Scheduler};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;

/// Open streams get this long to wind down after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn serve(config: ServerConfig) -> Result<()> {
    let scheduler = PriorityScheduler::new(config.scheduler.clone());
    let logs = Arc::new(MemoryLogStash::new(config.logstash.max_lines));

    if let Some(dashboard) = &config.dashboard {
        info!(uri = %dashboard.uri, "Dashboard telemetry enabled");
        scheduler.add_observer(DashboardObserver::spawn(&dashboard.uri, config.public_url()));
    }

    let state = AppState::new(scheduler.clone(), logs)
        .context("failed to register metrics")?
        .with_executor_init_timeout(config.scheduler.executor_init_timeout());
    let router = create_router(Arc::new(state));

    let shutdown = CancellationToken::new();
    let mut servers = JoinSet::new();
    for address in &config.listen_http {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;
        info!(address = %address, "Listening");

        let router = router.clone();
        let token = shutdown.clone();
        servers.spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
    }

    let runner = {
        let scheduler = scheduler.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { scheduler.run(token).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        Some(result) = servers.join_next() => {
            match result {
                Ok(Ok(())) => warn!("HTTP server stopped"),
                Ok(Err(err)) => error!(error = %err, "HTTP server failed"),
                Err(err) => error!(error = %err, "HTTP server task failed"),
            }
        }
    }

    info!("Shutting down");
    shutdown.cancel();
    runner.await.context("scheduler loop failed")?;

    if tokio::time::timeout(DRAIN_TIMEOUT, async {
        while servers.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Streams still open after drain timeout");
        servers.abort_all();
    }

    let stats = scheduler.statistics();
    info!(
        completed_builds = stats.completed_builds,
        completed_tasks = stats.completed_tasks,
        "Stopped"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
