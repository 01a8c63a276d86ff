//! Agent listing and lookup endpoints.

use crate::error::ApiError;
use crate::registry::AgentRecord;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::time::Duration;

/// Longest a lookup is allowed to wait for a registration.
const MAX_WAIT_MS: u64 = 10_000;

/// List all registered agents.
///
/// Capabilities are expanded to a real JSON array in the response.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentRecord>> {
    Json(state.registry.list())
}

/// Query parameters for [`get_agent`].
#[derive(Debug, Deserialize)]
pub struct GetAgentParams {
    /// Wait up to this many milliseconds for the agent to register before
    /// answering 404.
    pub wait_ms: Option<u64>,
}

/// Fetch one agent by id.
///
/// With `wait_ms`, the handler waits for the registration to arrive
/// instead of forcing the caller to poll; "not yet available" is still a
/// 404, just delayed by at most the bounded timeout.
pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<GetAgentParams>,
) -> Result<Json<AgentRecord>, ApiError> {
    let record = match params.wait_ms {
        Some(wait_ms) if wait_ms > MAX_WAIT_MS => {
            return Err(ApiError::BadRequest(format!(
                "wait_ms must be at most {MAX_WAIT_MS}"
            )));
        }
        Some(wait_ms) => {
            state
                .registry
                .wait_for(&agent_id, Duration::from_millis(wait_ms))
                .await
        }
        None => state.registry.get(&agent_id),
    };

    record
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("agent '{agent_id}'")))
}
