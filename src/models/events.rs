// src/models/events.rs
//! Duplex channel event names and payloads.
//!
//! Field names match what the dispatch server already speaks, so they are
//! spelled out with `rename_all = "camelCase"` rather than left to chance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::location::Coordinate;
use crate::models::offer::id_string;

pub mod names {
    // Inbound
    pub const NEW_RIDE_REQUEST: &str = "newRideRequest";
    pub const RIDE_CANCELLED: &str = "rideCancelled";
    pub const RIDE_TAKEN_BY_DRIVER: &str = "rideTakenByDriver";
    pub const RIDE_ALREADY_ACCEPTED: &str = "rideAlreadyAccepted";
    pub const RIDE_OTP: &str = "rideOTP";
    pub const USER_LIVE_LOCATION_UPDATE: &str = "userLiveLocationUpdate";
    pub const USER_DATA_FOR_DRIVER: &str = "userDataForDriver";
    pub const RIDE_STARTED: &str = "rideStarted";

    // Outbound
    pub const REGISTER_DRIVER: &str = "registerDriver";
    pub const DRIVER_LOCATION_UPDATE: &str = "driverLocationUpdate";
    pub const ACCEPT_RIDE: &str = "acceptRide";
    pub const DRIVER_ACCEPTED_RIDE: &str = "driverAcceptedRide";
    pub const REJECT_RIDE: &str = "rejectRide";
    pub const GET_USER_DATA_FOR_DRIVER: &str = "getUserDataForDriver";
    pub const OTP_VERIFIED: &str = "otpVerified";
    pub const DRIVER_STARTED_RIDE: &str = "driverStartedRide";
    pub const RIDE_STATUS_UPDATE: &str = "rideStatusUpdate";
    pub const DRIVER_COMPLETED_RIDE: &str = "driverCompletedRide";
    pub const DRIVER_RIDE_CANCELLED: &str = "driverRideCancelled";
    pub const DRIVER_OFFLINE: &str = "driverOffline";
}

/// An event as it comes off the wire, before interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChannelEvent {
    pub name: String,
    pub payload: Value,
}

impl RawChannelEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self { name: name.into(), payload }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewRideRequest(Value),
    RideCancelled { ride_id: String },
    RideTakenByDriver { ride_id: String, driver_id: Option<String>, message: Option<String> },
    RideAlreadyAccepted { ride_id: String },
    RideOtp { ride_id: String, otp: String },
    UserLiveLocation { ride_id: Option<String>, location: Coordinate },
    UserDataForDriver { ride_id: Option<String>, user_id: Option<String>, location: Option<Coordinate> },
    RideStarted { ride_id: String },
}

impl InboundEvent {
    /// Interpret a raw event. Unknown names and payloads missing their key
    /// fields yield `None`; the caller logs and drops them.
    pub fn parse(raw: &RawChannelEvent) -> Option<InboundEvent> {
        let payload = &raw.payload;
        let ride_id = || id_string(payload.get("rideId"));

        match raw.name.as_str() {
            names::NEW_RIDE_REQUEST => Some(InboundEvent::NewRideRequest(payload.clone())),
            names::RIDE_CANCELLED => Some(InboundEvent::RideCancelled { ride_id: ride_id()? }),
            names::RIDE_TAKEN_BY_DRIVER => Some(InboundEvent::RideTakenByDriver {
                ride_id: ride_id()?,
                driver_id: id_string(payload.get("driverId")),
                message: payload.get("message").and_then(Value::as_str).map(str::to_string),
            }),
            names::RIDE_ALREADY_ACCEPTED => Some(InboundEvent::RideAlreadyAccepted { ride_id: ride_id()? }),
            names::RIDE_OTP => Some(InboundEvent::RideOtp {
                ride_id: ride_id()?,
                otp: id_string(payload.get("otp"))?,
            }),
            names::USER_LIVE_LOCATION_UPDATE => Some(InboundEvent::UserLiveLocation {
                ride_id: ride_id(),
                location: coordinate_in(payload)?,
            }),
            names::USER_DATA_FOR_DRIVER => Some(InboundEvent::UserDataForDriver {
                ride_id: ride_id(),
                user_id: id_string(payload.get("userId")),
                location: coordinate_in(payload),
            }),
            names::RIDE_STARTED => Some(InboundEvent::RideStarted { ride_id: ride_id()? }),
            _ => None,
        }
    }
}

/// Live locations arrive flat (`lat`/`lng`) or nested under `userCurrentLocation`.
fn coordinate_in(payload: &Value) -> Option<Coordinate> {
    let candidate = payload.get("userCurrentLocation").unwrap_or(payload);
    let coordinate: Coordinate = serde_json::from_value(candidate.clone()).ok()?;
    coordinate.is_valid().then_some(coordinate)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDriverPayload {
    pub driver_id: String,
    pub driver_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    pub driver_id: String,
    pub driver_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: f64,
    pub bearing: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
    pub is_background: bool,
    pub is_online: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptResponse {
    #[serde(default)]
    pub success: bool,
    pub pickup: Option<Coordinate>,
    pub user_id: Option<Value>,
    pub user_name: Option<String>,
    pub user_mobile: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideTakenPayload {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverAcceptedPayload {
    pub ride_id: String,
    pub driver_id: String,
    pub user_id: Option<String>,
    pub driver_location: Option<Coordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejectRidePayload {
    pub ride_id: String,
    pub driver_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OtpVerifiedPayload {
    pub ride_id: String,
    pub driver_id: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub driver_location: Coordinate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdatePayload {
    pub ride_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp_verified: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideCompletedPayload {
    pub ride_id: String,
    pub driver_id: String,
    pub user_id: Option<String>,
    pub distance: f64,
    pub fare: i64,
    pub actual_pickup: Coordinate,
    pub actual_drop: Coordinate,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideCancelledPayload {
    pub ride_id: String,
    pub driver_id: String,
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn taken_event_accepts_numeric_driver_id() {
        let raw = RawChannelEvent::new(names::RIDE_TAKEN_BY_DRIVER, json!({"rideId": "R1", "driverId": 17}));
        assert_eq!(
            InboundEvent::parse(&raw),
            Some(InboundEvent::RideTakenByDriver {
                ride_id: "R1".to_string(),
                driver_id: Some("17".to_string()),
                message: None,
            })
        );
    }

    #[test]
    fn live_location_accepts_flat_and_nested_shapes() {
        let flat = RawChannelEvent::new(names::USER_LIVE_LOCATION_UPDATE, json!({"lat": 17.4, "lng": 78.4}));
        let nested = RawChannelEvent::new(
            names::USER_LIVE_LOCATION_UPDATE,
            json!({"rideId": "R1", "userCurrentLocation": {"latitude": 17.4, "longitude": 78.4}}),
        );
        assert!(matches!(InboundEvent::parse(&flat), Some(InboundEvent::UserLiveLocation { ride_id: None, .. })));
        assert!(matches!(
            InboundEvent::parse(&nested),
            Some(InboundEvent::UserLiveLocation { ride_id: Some(_), .. })
        ));
    }

    #[test]
    fn unknown_or_incomplete_events_are_dropped() {
        assert_eq!(InboundEvent::parse(&RawChannelEvent::new("somethingElse", json!({}))), None);
        assert_eq!(InboundEvent::parse(&RawChannelEvent::new(names::RIDE_OTP, json!({"rideId": "R1"}))), None);
    }

    #[test]
    fn completion_payload_uses_server_field_names() {
        let payload = RideCompletedPayload {
            ride_id: "R1".to_string(),
            driver_id: "drv-1".to_string(),
            user_id: None,
            distance: 4.83,
            fare: 72,
            actual_pickup: Coordinate::new(1.0, 2.0),
            actual_drop: Coordinate::new(1.1, 2.1),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        for key in ["rideId", "driverId", "userId", "distance", "fare", "actualPickup", "actualDrop", "timestamp"] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
    }
}
