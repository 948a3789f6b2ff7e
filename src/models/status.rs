// src/models/status.rs
//! Read model published by the coordinator for the presentation layer.

use serde::Serialize;

use crate::models::agent::DriverStatus;
use crate::models::location::Coordinate;
use crate::models::ride::{Passenger, Place, RideStatus, Settlement};

/// One-shot user-facing message attached to the next snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notice {
    #[serde(rename_all = "camelCase")]
    RideTaken { ride_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    RideCancelled { ride_id: String },
    #[serde(rename_all = "camelCase")]
    AcceptFailed { ride_id: String, reason: String },
    ConnectionLost,
    #[serde(rename_all = "camelCase")]
    WorkingHoursWarning { level: u8, remaining: String },
    #[serde(rename_all = "camelCase")]
    WorkingHoursExpired { deferred_until_ride_ends: bool },
    #[serde(rename_all = "camelCase")]
    WentOffline { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideView {
    pub ride_id: String,
    pub status: RideStatus,
    pub pickup: Place,
    pub drop: Place,
    pub fare_estimate: Option<f64>,
    pub distance_estimate_km: Option<f64>,
    pub otp_received: bool,
    pub passenger: Passenger,
    pub passenger_location: Option<Coordinate>,
    pub travelled_km: f64,
    pub remaining_route: Vec<Coordinate>,
    pub rider_details_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    pub driver_id: String,
    pub driver_name: String,
    pub vehicle_type: Option<String>,
    pub driver_status: DriverStatus,
    pub online: bool,
    pub channel_connected: bool,
    pub backgrounded: bool,
    pub remaining_working_time: Option<String>, // HH:MM:SS
    pub remaining_seconds: Option<u64>,
    pub warnings_issued: u8,
    pub offline_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub revision: u64,
    pub ride_status: RideStatus,
    pub ride: Option<RideView>,
    pub settlement: Option<Settlement>,
    pub agent: AgentView,
    pub notice: Option<Notice>,
    pub location: Option<Coordinate>,
}
