//! Service adapters for the buildq scheduler.
//!
//! [`services`] holds the transport-independent stream logic for clients,
//! workers and executors. [`routes`] exposes it over HTTP and WebSocket
//! together with administration, log and metrics endpoints.

pub mod dashboard;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;
pub mod ws;

pub use routes::create_router;
pub use state::AppState;
