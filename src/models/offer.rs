// src/models/offer.rs
//! Parsing of ride offers from the two intake paths.
//!
//! The dispatch server sends the same offer in two shapes: a JSON object on the
//! duplex channel (`newRideRequest`) and a flat string map in push data messages.
//! Both end up as a [`RideOffer`]; anything without a ride id or usable
//! coordinates is rejected rather than defaulted.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::errors::AgentError;
use crate::models::ride::{OfferSource, Place, RideOffer};

#[derive(Debug, Error, PartialEq)]
pub enum OfferError {
    #[error("missing ride id")]
    MissingRideId,

    #[error("missing or invalid coordinates for {0}")]
    InvalidCoordinates(&'static str),

    #[error("unparseable {field}: {reason}")]
    Unparseable { field: &'static str, reason: String },

    #[error("offer payload is not an object")]
    NotAnObject,
}

impl From<OfferError> for AgentError {
    fn from(err: OfferError) -> Self {
        match err {
            OfferError::MissingRideId => AgentError::missing("rideId"),
            other => AgentError::malformed(other.to_string()),
        }
    }
}

const UNKNOWN_ADDRESS: &str = "Unknown location";

impl RideOffer {
    /// Parse a `newRideRequest` payload from the duplex channel.
    pub fn from_channel_payload(payload: &Value, received_at: DateTime<Utc>) -> Result<Self, OfferError> {
        let obj = payload.as_object().ok_or(OfferError::NotAnObject)?;
        let field = |name: &str| obj.get(name);

        let ride_id = id_string(field("rideId")).ok_or(OfferError::MissingRideId)?;
        let pickup = place_from_value(field("pickup"), "pickup")?;
        let drop = place_from_value(field("drop"), "drop")?;

        Ok(RideOffer {
            ride_id,
            raid_id: text(field("RAID_ID")),
            pickup,
            drop,
            fare: field("fare").and_then(amount),
            distance_km: field("distance").and_then(amount),
            vehicle_type: text(field("vehicleType")),
            user_id: id_string(field("userId")),
            user_name: text(field("userName")),
            user_mobile: text(field("userMobile")).or_else(|| text(field("userPhone"))),
            otp: text(field("otp")),
            source: OfferSource::Channel,
            received_at,
        })
    }

    /// Parse a push-notification data map. All values arrive as strings.
    pub fn from_push_data(data: &HashMap<String, String>, received_at: DateTime<Utc>) -> Result<Self, OfferError> {
        let get = |name: &str| {
            data.get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let ride_id = get("rideId").ok_or(OfferError::MissingRideId)?.to_string();

        // Newer server builds embed the full place object, older ones flatten it.
        let pickup = match get("pickup") {
            Some(raw) => place_from_value(Some(&Value::String(raw.to_string())), "pickup")?,
            None => flat_place(get("pickupLat"), get("pickupLng"), get("pickupLocation"), "pickup")?,
        };
        let drop = match get("drop") {
            Some(raw) => place_from_value(Some(&Value::String(raw.to_string())), "drop")?,
            None => flat_place(get("dropLat"), get("dropLng"), get("dropLocation"), "drop")?,
        };

        let string_amount = |name: &str| get(name).and_then(|v| amount(&Value::String(v.to_string())));

        Ok(RideOffer {
            ride_id,
            raid_id: get("RAID_ID").map(str::to_string),
            pickup,
            drop,
            fare: string_amount("fare"),
            distance_km: string_amount("distance"),
            vehicle_type: get("vehicleType").map(str::to_string),
            user_id: get("userId").map(str::to_string),
            user_name: get("userName").map(str::to_string),
            user_mobile: get("userMobile").or_else(|| get("userPhone")).map(str::to_string),
            otp: get("otp").map(str::to_string),
            source: OfferSource::Push,
            received_at,
        })
    }
}

/// Ride and actor ids arrive as strings or numbers depending on the server path.
pub fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| format!("{}", f as i64))
            }
        }
        _ => None,
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Amounts like `60`, `"60"`, `"₹60.50"` or `"4 km"`.
fn amount(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite() && *v >= 0.0)
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn place_from_value(value: Option<&Value>, which: &'static str) -> Result<Place, OfferError> {
    let value = value.ok_or(OfferError::InvalidCoordinates(which))?;

    // Some server paths send the place JSON-encoded inside a string.
    let decoded;
    let obj = match value {
        Value::Object(obj) => obj,
        Value::String(raw) => {
            decoded = serde_json::from_str::<Value>(raw).map_err(|e| OfferError::Unparseable {
                field: which,
                reason: e.to_string(),
            })?;
            decoded.as_object().ok_or(OfferError::InvalidCoordinates(which))?
        }
        _ => return Err(OfferError::InvalidCoordinates(which)),
    };

    let latitude = number(obj.get("lat").or_else(|| obj.get("latitude")));
    let longitude = number(obj.get("lng").or_else(|| obj.get("longitude")));
    let address = text(obj.get("address")).unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

    checked_place(latitude, longitude, address, which)
}

fn flat_place(
    lat: Option<&str>,
    lng: Option<&str>,
    address: Option<&str>,
    which: &'static str,
) -> Result<Place, OfferError> {
    let latitude = lat.and_then(|v| v.parse::<f64>().ok());
    let longitude = lng.and_then(|v| v.parse::<f64>().ok());
    let address = address.unwrap_or(UNKNOWN_ADDRESS).to_string();
    checked_place(latitude, longitude, address, which)
}

fn checked_place(
    latitude: Option<f64>,
    longitude: Option<f64>,
    address: String,
    which: &'static str,
) -> Result<Place, OfferError> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => {
            let place = Place { latitude, longitude, address };
            if place.coordinate().is_valid() {
                Ok(place)
            } else {
                Err(OfferError::InvalidCoordinates(which))
            }
        }
        _ => Err(OfferError::InvalidCoordinates(which)),
    }
}
