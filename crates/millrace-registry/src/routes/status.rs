//! Consumer status endpoint.

use crate::handler::ConsumerStatus;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Status response: table size plus the latest consumer activity.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    /// Registered agents.
    pub agents: usize,

    /// Most recent applied control message, if any arrived yet.
    pub consumer: Option<ConsumerStatus>,
}

/// Report the registry's current state.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        agents: state.registry.len(),
        consumer: state.status.peek(),
    })
}
