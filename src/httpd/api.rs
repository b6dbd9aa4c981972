use super::json_error::JsonError;
use crate::app::AppState;
use axum::{extract::State, Json};

pub async fn get_api(State(state): State<AppState>) -> Json<swarm_json::Api> {
    Json(state.quadrant().api(state.counters().snapshot()))
}

pub async fn get_sideband_states(
    State(state): State<AppState>,
) -> Result<Json<swarm_json::SidebandStates>, JsonError> {
    state
        .quadrant()
        .sideband_states()
        .map(|table| Json(table.to_json()))
        .ok_or_else(|| JsonError::not_found(anyhow::anyhow!("no Walsh patterns configured")))
}
