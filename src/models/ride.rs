// src/models/ride.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::location::{Coordinate, RouteCoords};
use crate::services::tracking_service::{DistanceAccumulator, RouteProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RideStatus {
    Idle,      // No ride in the slot
    OnTheWay,  // Offer pending the driver's decision
    Accepted,  // Server confirmed, driving to pickup
    Started,   // OTP verified, driving to drop
    Completed, // Settled, waiting for the bill to be dismissed
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Idle => "idle",
            RideStatus::OnTheWay => "onTheWay",
            RideStatus::Accepted => "accepted",
            RideStatus::Started => "started",
            RideStatus::Completed => "completed",
        }
    }

    /// The agent owns the ride (server acknowledged the accept).
    pub fn owns_ride(&self) -> bool {
        matches!(self, RideStatus::Accepted | RideStatus::Started)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfferSource {
    Channel,
    Push,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
    pub address: String,
}

impl Place {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Inbound candidate ride. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideOffer {
    pub ride_id: String,
    #[serde(rename = "RAID_ID")]
    pub raid_id: Option<String>,
    pub pickup: Place,
    pub drop: Place,
    pub fare: Option<f64>,        // fare estimate
    pub distance_km: Option<f64>, // distance estimate
    pub vehicle_type: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_mobile: Option<String>,
    pub otp: Option<String>,
    pub source: OfferSource,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Passenger {
    pub user_id: Option<String>,
    pub name: String,
    pub mobile: String,
}

impl Passenger {
    pub fn from_offer(offer: &RideOffer) -> Self {
        Self {
            user_id: offer.user_id.clone(),
            name: offer.user_name.clone().unwrap_or_else(|| "Customer".to_string()),
            mobile: offer.user_mobile.clone().unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

/// Final fare record produced exactly once at `started -> completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub ride_id: String,
    pub distance_km: f64,
    pub rate_per_km: f64,
    pub fare: i64,
    pub user_name: String,
    pub user_mobile: String,
    pub actual_pickup: Coordinate,
    pub actual_drop: Coordinate,
    pub completed_at: DateTime<Utc>,
}

/// The ride currently held in the single slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRide {
    pub offer: RideOffer,
    pub status: RideStatus,
    pub otp: Option<String>,
    pub passenger: Passenger,
    pub passenger_location: Option<Coordinate>,
    pub route: RouteCoords,
    pub progress: RouteProgress,
    pub distance: DistanceAccumulator,
    pub otp_verification_location: Option<Coordinate>,
    pub rider_details_visible: bool,
    pub settlement: Option<Settlement>,
}

impl ActiveRide {
    pub fn from_offer(offer: RideOffer) -> Self {
        Self {
            otp: offer.otp.clone(),
            passenger: Passenger::from_offer(&offer),
            offer,
            status: RideStatus::OnTheWay,
            passenger_location: None,
            route: RouteCoords::default(),
            progress: RouteProgress::default(),
            distance: DistanceAccumulator::default(),
            otp_verification_location: None,
            rider_details_visible: true,
            settlement: None,
        }
    }

    pub fn ride_id(&self) -> &str {
        &self.offer.ride_id
    }
}
