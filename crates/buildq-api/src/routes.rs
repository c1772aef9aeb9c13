//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, health, logs, metrics};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;
use crate::ws;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::metrics))
        .route("/logs/{instance}", get(logs::get_log))
        .layer(axum_middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/builds", get(admin::list_builds))
        .route("/builds/{id}/cancel", post(admin::cancel_build))
        .route("/workers", get(admin::list_workers))
        .route("/reschedule", post(admin::reschedule))
        .nest("/ws", stream_routes())
}

fn stream_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/builds", get(ws::schedule_build))
        .route("/tasks", get(ws::schedule_task))
        .route("/worker/instructions", get(ws::get_instructions))
        .route("/worker/tasks", get(ws::get_tasks))
}
