// src/services/dispatch_service.rs
//! Offer intake and race resolution.
//!
//! Offers arrive on two unordered paths (duplex channel and push). Intake
//! decides whether an offer may take the ride slot; the race resolver decides
//! what a `rideTakenByDriver` broadcast means for this agent.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::MissingVehicleTypePolicy;
use crate::models::ride::{RideOffer, RideStatus};

/// Trim and lowercase. Empty after trimming counts as missing.
pub fn normalize_vehicle_type(raw: Option<&str>) -> Option<String> {
    raw.map(|v| v.trim().to_lowercase()).filter(|v| !v.is_empty())
}

/// The one rule for vehicle-type compatibility.
pub fn vehicle_types_match(agent: Option<&str>, offer: Option<&str>, policy: MissingVehicleTypePolicy) -> bool {
    match (normalize_vehicle_type(agent), normalize_vehicle_type(offer)) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => policy == MissingVehicleTypePolicy::Wildcard,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admit,
    Duplicate,
    SlotOccupied { current: String },
    VehicleTypeMismatch { ours: Option<String>, theirs: Option<String> },
}

impl Admission {
    pub fn reason(&self) -> String {
        match self {
            Admission::Admit => "admitted".to_string(),
            Admission::Duplicate => "duplicate offer".to_string(),
            Admission::SlotOccupied { current } => format!("ride slot occupied by {}", current),
            Admission::VehicleTypeMismatch { ours, theirs } => format!(
                "vehicle type mismatch (ours {:?}, offer {:?})",
                ours.as_deref().unwrap_or("-"),
                theirs.as_deref().unwrap_or("-")
            ),
        }
    }
}

/// What a `rideTakenByDriver` broadcast means for this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    /// Another driver won the current pending offer: drop it.
    Discard,
    /// The broadcast is about our own accept.
    SelfEcho,
    /// Not about the ride in our slot, or we already own it.
    NotApplicable,
}

pub struct DispatchIntake {
    vehicle_type: Option<String>,
    policy: MissingVehicleTypePolicy,
    window: Duration,
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl DispatchIntake {
    pub fn new(vehicle_type: Option<&str>, policy: MissingVehicleTypePolicy, window: Duration) -> Self {
        Self {
            vehicle_type: normalize_vehicle_type(vehicle_type),
            policy,
            window,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn vehicle_type(&self) -> Option<&str> {
        self.vehicle_type.as_deref()
    }

    /// Decide whether `offer` may take the slot. Every evaluated ride id is
    /// remembered for the dedup window, whatever the outcome.
    pub fn admit(&mut self, offer: &RideOffer, current: Option<(&str, RideStatus)>, now: DateTime<Utc>) -> Admission {
        self.expire(now);

        if self.seen.contains_key(&offer.ride_id) || current.is_some_and(|(id, _)| id == offer.ride_id) {
            return Admission::Duplicate;
        }
        self.remember(&offer.ride_id, now);

        if !vehicle_types_match(self.vehicle_type.as_deref(), offer.vehicle_type.as_deref(), self.policy) {
            return Admission::VehicleTypeMismatch {
                ours: self.vehicle_type.clone(),
                theirs: normalize_vehicle_type(offer.vehicle_type.as_deref()),
            };
        }

        if let Some((id, status)) = current {
            if status != RideStatus::Idle {
                return Admission::SlotOccupied { current: id.to_string() };
            }
        }

        Admission::Admit
    }

    /// Resolve a taken broadcast against the slot. Ids are compared as normalized strings.
    pub fn resolve_taken(
        &self,
        ride_id: &str,
        taken_by: Option<&str>,
        self_id: &str,
        current: Option<(&str, RideStatus)>,
    ) -> RaceOutcome {
        if taken_by.map(str::trim) == Some(self_id.trim()) {
            return RaceOutcome::SelfEcho;
        }
        match current {
            Some((id, RideStatus::OnTheWay)) if id == ride_id => RaceOutcome::Discard,
            _ => RaceOutcome::NotApplicable,
        }
    }

    fn remember(&mut self, ride_id: &str, now: DateTime<Utc>) {
        self.seen.insert(ride_id.to_string(), now);
        self.order.push_back((ride_id.to_string(), now));
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        while let Some((id, at)) = self.order.front() {
            let age = (now - *at).to_std().unwrap_or(Duration::ZERO);
            if age < self.window {
                break;
            }
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ride::{OfferSource, Place};
    use chrono::Duration as ChronoDuration;

    fn offer(id: &str, vehicle: Option<&str>) -> RideOffer {
        RideOffer {
            ride_id: id.to_string(),
            raid_id: None,
            pickup: Place { latitude: 1.0, longitude: 1.0, address: "A".to_string() },
            drop: Place { latitude: 1.1, longitude: 1.1, address: "B".to_string() },
            fare: None,
            distance_km: None,
            vehicle_type: vehicle.map(str::to_string),
            user_id: None,
            user_name: None,
            user_mobile: None,
            otp: None,
            source: OfferSource::Channel,
            received_at: Utc::now(),
        }
    }

    fn intake(vehicle: Option<&str>, policy: MissingVehicleTypePolicy) -> DispatchIntake {
        DispatchIntake::new(vehicle, policy, Duration::from_secs(600))
    }

    #[test]
    fn vehicle_types_compare_trimmed_and_case_insensitive() {
        let p = MissingVehicleTypePolicy::NeverMatch;
        assert!(vehicle_types_match(Some(" Taxi"), Some("taxi "), p));
        assert!(!vehicle_types_match(Some("taxi"), Some("bike"), p));
        assert!(!vehicle_types_match(Some("taxi"), Some("   "), p));
        assert!(!vehicle_types_match(None, Some("taxi"), p));
        assert!(vehicle_types_match(None, Some("taxi"), MissingVehicleTypePolicy::Wildcard));
        assert!(vehicle_types_match(Some("taxi"), None, MissingVehicleTypePolicy::Wildcard));
    }

    #[test]
    fn same_ride_on_both_paths_is_admitted_once() {
        let mut intake = intake(Some("taxi"), MissingVehicleTypePolicy::NeverMatch);
        let now = Utc::now();
        let mut from_push = offer("R1", Some("taxi"));
        from_push.source = OfferSource::Push;

        assert_eq!(intake.admit(&offer("R1", Some("taxi")), None, now), Admission::Admit);
        assert_eq!(intake.admit(&from_push, Some(("R1", RideStatus::OnTheWay)), now), Admission::Duplicate);
    }

    #[test]
    fn dedup_window_expires() {
        let mut intake = intake(Some("taxi"), MissingVehicleTypePolicy::NeverMatch);
        let now = Utc::now();
        assert_eq!(intake.admit(&offer("R1", Some("taxi")), None, now), Admission::Admit);
        assert_eq!(intake.admit(&offer("R1", Some("taxi")), None, now + ChronoDuration::seconds(30)), Admission::Duplicate);
        assert_eq!(intake.admit(&offer("R1", Some("taxi")), None, now + ChronoDuration::seconds(601)), Admission::Admit);
    }

    #[test]
    fn occupied_slot_rejects_new_offers() {
        let mut intake = intake(Some("taxi"), MissingVehicleTypePolicy::NeverMatch);
        let outcome = intake.admit(&offer("R2", Some("taxi")), Some(("R1", RideStatus::Started)), Utc::now());
        assert_eq!(outcome, Admission::SlotOccupied { current: "R1".to_string() });

        let outcome = intake.admit(&offer("R3", Some("taxi")), Some(("R1", RideStatus::Completed)), Utc::now());
        assert_eq!(outcome, Admission::SlotOccupied { current: "R1".to_string() });
    }

    #[test]
    fn missing_vehicle_type_follows_policy() {
        let mut strict = intake(Some("taxi"), MissingVehicleTypePolicy::NeverMatch);
        assert!(matches!(
            strict.admit(&offer("R1", None), None, Utc::now()),
            Admission::VehicleTypeMismatch { .. }
        ));

        let mut lenient = intake(Some("taxi"), MissingVehicleTypePolicy::Wildcard);
        assert_eq!(lenient.admit(&offer("R1", None), None, Utc::now()), Admission::Admit);
    }

    #[test]
    fn taken_broadcast_resolution() {
        let intake = intake(Some("taxi"), MissingVehicleTypePolicy::NeverMatch);
        let pending = Some(("R1", RideStatus::OnTheWay));

        assert_eq!(intake.resolve_taken("R1", Some("drv-2"), "drv-1", pending), RaceOutcome::Discard);
        assert_eq!(intake.resolve_taken("R1", None, "drv-1", pending), RaceOutcome::Discard);
        assert_eq!(intake.resolve_taken("R1", Some("drv-1"), "drv-1", pending), RaceOutcome::SelfEcho);
        assert_eq!(intake.resolve_taken("R9", Some("drv-2"), "drv-1", pending), RaceOutcome::NotApplicable);
        assert_eq!(
            intake.resolve_taken("R1", Some("drv-2"), "drv-1", Some(("R1", RideStatus::Accepted))),
            RaceOutcome::NotApplicable
        );
    }
}
