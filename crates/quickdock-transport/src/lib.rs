//! Transport layer for quickdock.
//!
//! Exposes the session crate over HTTP:
//! - `/api/ws/events` - WebSocket feed of state snapshots
//! - `/api/ws/exec/{container_id}` - WebSocket terminal
//! - `/api/container/{container_id}/logs` - SSE log stream
//! - JSON routes for health, listings and lifecycle actions

pub mod error;
pub mod protocol;
pub mod rest;
pub mod sse;
pub mod state;
pub mod websocket;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use error::ApiError;
pub use protocol::{EventMessage, ExecClientMessage, ExecServerMessage};
pub use state::AppState;

/// Build the API router.
///
/// # Example
/// ```ignore
/// let app = router(state).fallback_service(ServeDir::new("frontend"));
/// ```
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(rest::health))
        .route("/api/projects", get(rest::list_projects))
        .route("/api/containers", get(rest::list_containers))
        .route("/api/compose/{project}/{action}", post(rest::compose_action))
        .route("/api/container/{container_id}", delete(rest::remove_container))
        .route(
            "/api/container/{container_id}/{action}",
            post(rest::container_action),
        )
        .route("/api/container/{container_id}/logs", get(sse::container_logs))
        .route("/api/ws/events", get(websocket::events_ws))
        .route("/api/ws/exec/{container_id}", get(websocket::exec_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
