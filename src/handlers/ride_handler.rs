// src/handlers/ride_handler.rs
use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult};
use crate::models::ride::Settlement;
use crate::models::status::StatusSnapshot;
use crate::services::notification_service::RideAction;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub otp: String,
}

#[derive(Debug, Deserialize)]
pub struct RiderDetailsRequest {
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationActionRequest {
    pub action: RideAction,
    pub ride_id: String,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.coordinator.snapshot())
}

pub async fn get_settlement(State(state): State<Arc<AppState>>) -> AgentResult<Json<Settlement>> {
    state
        .coordinator
        .snapshot()
        .settlement
        .map(Json)
        .ok_or(AgentError::NoActiveRide)
}

pub async fn accept_ride(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    let status = state.coordinator.accept().await?;
    Ok(Json(json!({ "success": true, "rideStatus": status })))
}

pub async fn reject_ride(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    state.coordinator.reject().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<OtpRequest>,
) -> AgentResult<Json<Value>> {
    state.coordinator.verify_otp(&payload.otp).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn complete_ride(State(state): State<Arc<AppState>>) -> AgentResult<Json<Settlement>> {
    let settlement = state.coordinator.complete().await?;
    Ok(Json(settlement))
}

pub async fn acknowledge_settlement(State(state): State<Arc<AppState>>) -> AgentResult<Json<Value>> {
    state.coordinator.acknowledge_settlement().await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn set_rider_details(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RiderDetailsRequest>,
) -> AgentResult<Json<Value>> {
    state.coordinator.set_rider_details_visible(payload.visible).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn notification_action(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NotificationActionRequest>,
) -> AgentResult<Json<Value>> {
    state
        .coordinator
        .notification_action(payload.action, &payload.ride_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}
