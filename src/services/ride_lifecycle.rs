// src/services/ride_lifecycle.rs
//! The single ride slot and its state machine.
//!
//! ```text
//! idle -> onTheWay -> accepted -> started -> completed -> idle
//!            |            |           |
//!            +------------+-----------+--> idle (reject, race loss, cancel)
//! ```
//!
//! Pure and synchronous: the coordinator performs the I/O and feeds results
//! back in. Only a server acknowledgement moves `onTheWay` to `accepted`.

use chrono::{DateTime, Utc};

use crate::errors::{AgentError, AgentResult};
use crate::models::events::{AcceptRequest, AcceptResponse};
use crate::models::location::{Coordinate, RouteCoords};
use crate::models::offer::id_string;
use crate::models::ride::{ActiveRide, RideOffer, RideStatus, Settlement};
use crate::services::tracking_service::RouteLeg;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tariff {
    pub default_rate_per_km: f64,
    pub min_billable_km: f64,
}

impl Default for Tariff {
    fn default() -> Self {
        Self {
            default_rate_per_km: 15.0,
            min_billable_km: 0.1,
        }
    }
}

impl Tariff {
    /// Quoted fare over quoted distance when both are positive, else the default rate.
    pub fn rate_for(&self, fare_estimate: Option<f64>, distance_estimate: Option<f64>) -> f64 {
        match (fare_estimate, distance_estimate) {
            (Some(fare), Some(distance)) if fare > 0.0 && distance > 0.0 => fare / distance,
            _ => self.default_rate_per_km,
        }
    }

    /// Billable distance and rounded fare for a measured distance.
    pub fn settle(&self, distance_km: f64, rate_per_km: f64) -> (f64, i64) {
        let billable = distance_km.max(self.min_billable_km);
        (billable, (billable * rate_per_km).round() as i64)
    }
}

#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted,
    /// Connectivity or timeout failure; the offer stays `onTheWay`.
    Failed(AgentError),
    /// The server said no; the offer was dropped.
    Lost { ride_id: String, message: Option<String> },
    /// The slot moved on while the request was in flight.
    Stale,
}

#[derive(Debug, Default)]
pub struct RideLifecycle {
    ride: Option<ActiveRide>,
    accept_in_flight: Option<String>,
}

impl RideLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(ride: ActiveRide) -> Self {
        Self {
            ride: Some(ride),
            accept_in_flight: None,
        }
    }

    pub fn status(&self) -> RideStatus {
        self.ride.as_ref().map(|r| r.status).unwrap_or(RideStatus::Idle)
    }

    pub fn ride(&self) -> Option<&ActiveRide> {
        self.ride.as_ref()
    }

    pub fn current(&self) -> Option<(&str, RideStatus)> {
        self.ride.as_ref().map(|r| (r.ride_id(), r.status))
    }

    pub fn is_current(&self, ride_id: &str) -> bool {
        self.ride.as_ref().is_some_and(|r| r.ride_id() == ride_id)
    }

    pub fn accept_in_flight(&self) -> bool {
        self.accept_in_flight.is_some()
    }

    /// `idle -> onTheWay`.
    pub fn present(&mut self, offer: RideOffer) -> AgentResult<()> {
        if let Some(ride) = &self.ride {
            return Err(AgentError::SlotOccupied(ride.ride_id().to_string()));
        }
        tracing::info!("Presenting ride offer: {}", offer.ride_id);
        self.ride = Some(ActiveRide::from_offer(offer));
        Ok(())
    }

    /// Start an accept. At most one in flight per ride.
    pub fn begin_accept(&mut self, driver_id: &str, driver_name: &str) -> AgentResult<AcceptRequest> {
        let ride = self.ride.as_ref().ok_or(AgentError::NoActiveRide)?;
        if ride.status != RideStatus::OnTheWay {
            return Err(AgentError::invalid_status(RideStatus::OnTheWay.as_str(), ride.status));
        }
        if self.accept_in_flight.is_some() {
            return Err(AgentError::AcceptInFlight);
        }
        self.accept_in_flight = Some(ride.ride_id().to_string());
        Ok(AcceptRequest {
            ride_id: ride.ride_id().to_string(),
            driver_id: driver_id.to_string(),
            driver_name: driver_name.to_string(),
        })
    }

    /// Apply the accept result for `ride_id`.
    pub fn finish_accept(&mut self, ride_id: &str, result: AgentResult<AcceptResponse>) -> AcceptOutcome {
        if self.accept_in_flight.as_deref() == Some(ride_id) {
            self.accept_in_flight = None;
        }

        let still_pending = self
            .ride
            .as_ref()
            .is_some_and(|r| r.ride_id() == ride_id && r.status == RideStatus::OnTheWay);
        if !still_pending {
            tracing::warn!("Accept result for ride {} arrived after the slot moved on", ride_id);
            return AcceptOutcome::Stale;
        }

        match result {
            Ok(response) if response.success => {
                if let Some(ride) = self.ride.as_mut() {
                    ride.status = RideStatus::Accepted;
                    if let Some(user_id) = id_string(response.user_id.as_ref()) {
                        ride.passenger.user_id = Some(user_id);
                    }
                    if let Some(name) = response.user_name.filter(|n| !n.trim().is_empty()) {
                        ride.passenger.name = name;
                    }
                    if let Some(mobile) = response.user_mobile.filter(|m| !m.trim().is_empty()) {
                        ride.passenger.mobile = mobile;
                    }
                }
                tracing::info!("Ride {} accepted", ride_id);
                AcceptOutcome::Accepted
            }
            Ok(response) => {
                tracing::info!("Accept for ride {} declined by server", ride_id);
                self.ride = None;
                AcceptOutcome::Lost {
                    ride_id: ride_id.to_string(),
                    message: response.message,
                }
            }
            Err(e) => {
                tracing::warn!("Accept for ride {} failed: {}", ride_id, e);
                AcceptOutcome::Failed(e)
            }
        }
    }

    /// `onTheWay -> idle` on the driver's decision.
    pub fn reject(&mut self) -> AgentResult<RideOffer> {
        let ride = self.ride.as_ref().ok_or(AgentError::NoActiveRide)?;
        if ride.status != RideStatus::OnTheWay {
            return Err(AgentError::invalid_status(RideStatus::OnTheWay.as_str(), ride.status));
        }
        if self.accept_in_flight.is_some() {
            return Err(AgentError::AcceptInFlight);
        }
        let ride = self.ride.take().ok_or(AgentError::NoActiveRide)?;
        tracing::info!("Ride offer {} rejected", ride.ride_id());
        Ok(ride.offer)
    }

    /// Empty the slot if it holds `ride_id` (cancellation, race loss, preemption).
    pub fn discard(&mut self, ride_id: &str) -> Option<ActiveRide> {
        if !self.is_current(ride_id) {
            return None;
        }
        if self.accept_in_flight.as_deref() == Some(ride_id) {
            self.accept_in_flight = None;
        }
        tracing::info!("Ride {} cleared from slot", ride_id);
        self.ride.take()
    }

    pub fn attach_otp(&mut self, ride_id: &str, otp: &str) -> bool {
        match self.ride.as_mut() {
            Some(ride) if ride.ride_id() == ride_id && ride.status != RideStatus::Completed => {
                ride.otp = Some(otp.trim().to_string());
                true
            }
            _ => false,
        }
    }

    /// `accepted -> started` when `code` matches the server OTP.
    /// Distance counting restarts at `position`.
    pub fn verify_otp(&mut self, code: &str, position: Coordinate) -> AgentResult<()> {
        let ride = self.ride.as_mut().ok_or(AgentError::NoActiveRide)?;
        if ride.status != RideStatus::Accepted {
            return Err(AgentError::invalid_status(RideStatus::Accepted.as_str(), ride.status));
        }
        let expected = ride.otp.as_deref().ok_or(AgentError::OtpUnavailable)?;
        if expected != code.trim() {
            return Err(AgentError::OtpMismatch);
        }

        ride.status = RideStatus::Started;
        ride.otp_verification_location = Some(position);
        ride.distance.reset_at(position);
        ride.route = RouteCoords::default();
        ride.progress.restart(RouteLeg::Drop);
        tracing::info!("OTP verified, ride {} started", ride.ride_id());
        Ok(())
    }

    /// Feed a location sample. Distance accrues only while `started`.
    pub fn record_position(&mut self, position: Coordinate) -> f64 {
        match self.ride.as_mut() {
            Some(ride) if ride.status == RideStatus::Started => ride.distance.record(position),
            _ => 0.0,
        }
    }

    /// `started -> completed`. A second call returns the existing settlement.
    pub fn complete(&mut self, position: Coordinate, tariff: &Tariff, now: DateTime<Utc>) -> AgentResult<Settlement> {
        let ride = self.ride.as_mut().ok_or(AgentError::NoActiveRide)?;
        if ride.status == RideStatus::Completed {
            if let Some(settlement) = &ride.settlement {
                return Ok(settlement.clone());
            }
        }
        if ride.status != RideStatus::Started {
            return Err(AgentError::invalid_status(RideStatus::Started.as_str(), ride.status));
        }

        ride.distance.record(position);
        let rate = tariff.rate_for(ride.offer.fare, ride.offer.distance_km);
        let (distance_km, fare) = tariff.settle(ride.distance.total_km(), rate);

        let settlement = Settlement {
            ride_id: ride.ride_id().to_string(),
            distance_km,
            rate_per_km: rate,
            fare,
            user_name: ride.passenger.name.clone(),
            user_mobile: ride.passenger.mobile.clone(),
            actual_pickup: ride.otp_verification_location.unwrap_or_else(|| ride.offer.pickup.coordinate()),
            actual_drop: position,
            completed_at: now,
        };
        ride.status = RideStatus::Completed;
        ride.settlement = Some(settlement.clone());
        tracing::info!(
            "Ride {} completed: {:.2} km at {:.2}/km = {}",
            settlement.ride_id,
            distance_km,
            rate,
            fare
        );
        Ok(settlement)
    }

    /// `completed -> idle` once the bill has been shown.
    pub fn acknowledge_settlement(&mut self) -> AgentResult<Settlement> {
        let ride = self.ride.as_ref().ok_or(AgentError::NoActiveRide)?;
        if ride.status != RideStatus::Completed {
            return Err(AgentError::invalid_status(RideStatus::Completed.as_str(), ride.status));
        }
        let settlement = ride.settlement.clone().ok_or(AgentError::NoActiveRide)?;
        self.ride = None;
        Ok(settlement)
    }

    /// Install a fetched route if it is still for the current ride and leg.
    pub fn set_route(&mut self, ride_id: &str, leg: RouteLeg, route: RouteCoords) -> bool {
        match self.ride.as_mut() {
            Some(ride) if ride.ride_id() == ride_id && RouteLeg::for_status(ride.status) == Some(leg) => {
                ride.route = route;
                ride.progress.restart(leg);
                true
            }
            _ => false,
        }
    }

    /// Advance along the route. Returns the deviation from it in metres.
    pub fn track_progress(&mut self, position: Coordinate) -> Option<f64> {
        let ride = self.ride.as_mut()?;
        if !ride.status.owns_ride() {
            return None;
        }
        ride.progress.advance(position, &ride.route).map(|(_, meters)| meters)
    }

    pub fn set_passenger_location(&mut self, ride_id: Option<&str>, location: Coordinate) -> bool {
        match self.ride.as_mut() {
            Some(ride) if ride_id.is_none_or(|id| id == ride.ride_id()) && ride.status.owns_ride() => {
                ride.passenger_location = Some(location);
                true
            }
            _ => false,
        }
    }

    pub fn set_passenger_id(&mut self, ride_id: Option<&str>, user_id: &str) -> bool {
        match self.ride.as_mut() {
            Some(ride) if ride_id.is_none_or(|id| id == ride.ride_id()) => {
                ride.passenger.user_id = Some(user_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn set_rider_details_visible(&mut self, visible: bool) -> bool {
        match self.ride.as_mut() {
            Some(ride) => {
                ride.rider_details_visible = visible;
                true
            }
            None => false,
        }
    }
}
