// src/handlers/agent_handler.rs
use axum::{Json, extract::State};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::errors::AgentResult;
use crate::models::status::AgentView;
use crate::services::working_hours_service::format_hms;
use crate::state::AppState;

pub async fn get_agent(State(state): State<Arc<AppState>>) -> Json<AgentView> {
    Json(state.coordinator.snapshot().agent)
}

pub async fn go_online(State(state): State<Arc<AppState>>) -> AgentResult<Json<AgentView>> {
    state.coordinator.go_online().await?;
    Ok(Json(state.coordinator.snapshot().agent))
}

pub async fn go_offline(State(state): State<Arc<AppState>>) -> AgentResult<Json<AgentView>> {
    state.coordinator.go_offline().await?;
    Ok(Json(state.coordinator.snapshot().agent))
}

pub async fn extend_hours(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    let remaining = state.coordinator.extend_hours().await?;
    Ok(Json(json!({
        "success": true,
        "remainingSeconds": remaining,
        "remainingWorkingTime": format_hms(remaining),
    })))
}

pub async fn enter_background(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    state.coordinator.enter_background().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn enter_foreground(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    state.coordinator.enter_foreground().await?;
    Ok(Json(json!({ "success": true })))
}

/// Completions still waiting for delivery.
pub async fn pending_completions(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    let pending = state.outbox.pending().await?;
    let rides: Vec<&str> = pending.iter().map(|e| e.ride_id.as_str()).collect();
    Ok(Json(json!({ "count": rides.len(), "rideIds": rides })))
}
