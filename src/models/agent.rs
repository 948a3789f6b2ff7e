// src/models/agent.rs
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DriverStatus {
    Offline, // Not receiving offers
    Online,  // Available, no owned ride
    OnRide,  // Accepted or started ride
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Offline => "offline",
            DriverStatus::Online => "online",
            DriverStatus::OnRide => "onRide",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub driver_id: String,
    pub driver_name: String,
    pub vehicle_type: Option<String>, // never defaulted, see DispatchIntake
    pub status: DriverStatus,
    pub online: bool,
    pub online_seconds: u64,
}

impl AgentState {
    pub fn new(driver_id: impl Into<String>, driver_name: impl Into<String>, vehicle_type: Option<String>) -> Self {
        Self {
            driver_id: driver_id.into(),
            driver_name: driver_name.into(),
            vehicle_type,
            status: DriverStatus::Offline,
            online: false,
            online_seconds: 0,
        }
    }
}
