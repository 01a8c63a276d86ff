//! API route definitions.

mod agents;
mod health;
mod status;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete API router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /agents` - List all registered agents
/// - `GET /agents/{agent_id}` - One agent; `?wait_ms=N` waits for it to
///   register before answering 404
/// - `GET /status` - Control consumer status snapshot
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/agents", get(agents::list_agents))
        .route("/agents/{agent_id}", get(agents::get_agent))
        .route("/status", get(status::status))
        .with_state(state)
}
