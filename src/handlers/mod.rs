// src/handlers/mod.rs
pub mod agent_handler;
pub mod ride_handler;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Local status and command surface for the driver UI.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ride/status", get(ride_handler::get_status))
        .route("/ride/settlement", get(ride_handler::get_settlement))
        .route("/ride/settlement/ack", post(ride_handler::acknowledge_settlement))
        .route("/ride/accept", post(ride_handler::accept_ride))
        .route("/ride/reject", post(ride_handler::reject_ride))
        .route("/ride/otp", post(ride_handler::verify_otp))
        .route("/ride/complete", post(ride_handler::complete_ride))
        .route("/ride/rider-details", post(ride_handler::set_rider_details))
        .route("/notifications/action", post(ride_handler::notification_action))
        .route("/agent", get(agent_handler::get_agent))
        .route("/agent/online", post(agent_handler::go_online))
        .route("/agent/offline", post(agent_handler::go_offline))
        .route("/agent/extend", post(agent_handler::extend_hours))
        .route("/agent/background", post(agent_handler::enter_background))
        .route("/agent/foreground", post(agent_handler::enter_foreground))
        .route("/agent/pending-completions", get(agent_handler::pending_completions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
