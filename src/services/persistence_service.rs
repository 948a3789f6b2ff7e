// src/services/persistence_service.rs
//! Ride state persistence and startup recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AgentError, AgentResult};
use crate::models::agent::DriverStatus;
use crate::models::location::{Coordinate, RouteCoords};
use crate::models::ride::{ActiveRide, Passenger, RideOffer, RideStatus, Settlement};
use crate::services::state_store::{StateStoreService, StoreKeys};
use crate::services::tracking_service::{DistanceAccumulator, RouteProgress};

/// Stored under `rideState`. Field names match what earlier app builds wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRideState {
    pub ride: RideOffer,
    pub user_data: Passenger,
    pub ride_status: RideStatus,
    pub driver_status: DriverStatus,
    pub otp: Option<String>,
    pub travelled_km: f64,
    pub last_coord: Option<Coordinate>,
    pub otp_verification_location: Option<Coordinate>,
    pub full_route_coords: RouteCoords,
    pub visible_route_coords: Vec<Coordinate>,
    #[serde(default)]
    pub route_progress: RouteProgress,
    pub user_location: Option<Coordinate>,
    #[serde(default = "default_visible")]
    pub rider_details_visible: bool,
    pub settlement: Option<Settlement>,
    pub saved_at: DateTime<Utc>,
}

fn default_visible() -> bool {
    true
}

impl PersistedRideState {
    pub fn capture(ride: &ActiveRide, driver_status: DriverStatus, now: DateTime<Utc>) -> Self {
        let visible_route_coords = match ride.distance.last_coord {
            Some(here) => ride.route.remaining_from(ride.progress.index, here),
            None => ride.route.points().to_vec(),
        };
        Self {
            ride: ride.offer.clone(),
            user_data: ride.passenger.clone(),
            ride_status: ride.status,
            driver_status,
            otp: ride.otp.clone(),
            travelled_km: ride.distance.travelled_km,
            last_coord: ride.distance.last_coord,
            otp_verification_location: ride.otp_verification_location,
            full_route_coords: ride.route.clone(),
            visible_route_coords,
            route_progress: ride.progress.clone(),
            user_location: ride.passenger_location,
            rider_details_visible: ride.rider_details_visible,
            settlement: ride.settlement.clone(),
            saved_at: now,
        }
    }

    pub fn into_active_ride(self) -> ActiveRide {
        ActiveRide {
            offer: self.ride,
            status: self.ride_status,
            otp: self.otp,
            passenger: self.user_data,
            passenger_location: self.user_location,
            route: self.full_route_coords,
            progress: self.route_progress,
            distance: DistanceAccumulator {
                travelled_km: self.travelled_km,
                last_coord: self.last_coord,
            },
            otp_verification_location: self.otp_verification_location,
            rider_details_visible: self.rider_details_visible,
            settlement: self.settlement,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    Nothing,
    /// A completed record was found and discarded.
    DiscardedCompleted(String),
    Restored(ActiveRide),
}

#[derive(Clone)]
pub struct RidePersistence {
    store: StateStoreService,
}

impl RidePersistence {
    pub fn new(store: StateStoreService) -> Self {
        Self { store }
    }

    /// Persist the ride and mirror its status for the background emitter.
    pub async fn save(&self, ride: &ActiveRide, driver_status: DriverStatus, now: DateTime<Utc>) -> AgentResult<()> {
        let record = PersistedRideState::capture(ride, driver_status, now);
        self.store.set_json(StoreKeys::RIDE_STATE, &record).await?;
        self.save_status(ride.status).await?;
        tracing::debug!("Persisted ride {} as {}", ride.ride_id(), ride.status);
        Ok(())
    }

    pub async fn save_status(&self, status: RideStatus) -> AgentResult<()> {
        self.store.set_json(StoreKeys::CURRENT_RIDE_STATUS, &status).await
    }

    pub async fn clear(&self) -> AgentResult<()> {
        self.store.remove(StoreKeys::RIDE_STATE).await?;
        self.save_status(RideStatus::Idle).await
    }

    /// Read the persisted ride. Only `accepted` and `started` rides come back;
    /// anything else is removed so it cannot resurface later.
    pub async fn load(&self) -> AgentResult<Recovered> {
        let record: Option<PersistedRideState> = match self.store.get_json(StoreKeys::RIDE_STATE).await {
            Ok(record) => record,
            Err(AgentError::StoreSerialization(msg)) => {
                tracing::warn!("Discarding unreadable ride state: {}", msg);
                self.clear().await?;
                return Ok(Recovered::Nothing);
            }
            Err(e) => return Err(e),
        };

        let Some(record) = record else {
            return Ok(Recovered::Nothing);
        };

        match record.ride_status {
            RideStatus::Accepted | RideStatus::Started => {
                tracing::info!("Restoring ride {} as {}", record.ride.ride_id, record.ride_status);
                Ok(Recovered::Restored(record.into_active_ride()))
            }
            RideStatus::Completed => {
                tracing::info!("Discarding completed ride {} at startup", record.ride.ride_id);
                self.clear().await?;
                Ok(Recovered::DiscardedCompleted(record.ride.ride_id))
            }
            other => {
                tracing::warn!("Discarding persisted ride {} in state {}", record.ride.ride_id, other);
                self.clear().await?;
                Ok(Recovered::Nothing)
            }
        }
    }
}
