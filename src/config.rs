//! Agent configuration.
//!
//! Values come from `DRIVER_*` environment variables (an optional `.env` file is
//! loaded first), falling back to the defaults below. Parsing goes through
//! [`AgentConfig::from_lookup`] so it can be exercised without touching the
//! process environment.

use std::time::Duration;

use crate::errors::{AgentError, AgentResult};

const ENV_PREFIX: &str = "DRIVER_";

/// What happens when the working-hours budget runs out while a ride is owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// End the owned ride locally and go offline immediately.
    Preempt,
    /// Stay online until the ride completes or is cancelled, then go offline.
    WaitForCompletion,
}

/// How an offer or agent without a vehicle type is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingVehicleTypePolicy {
    NeverMatch,
    Wildcard,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    // Identity
    pub driver_id: String,
    pub driver_name: String,
    pub vehicle_type: Option<String>,

    // Endpoints
    pub api_base_url: String,
    pub osrm_url: Option<String>,
    pub redis_url: Option<String>,
    pub status_bind_addr: String,

    // Tracking
    pub foreground_sample_interval: Duration,
    pub offline_sample_interval: Duration,
    pub background_emit_interval: Duration,
    pub location_emit_interval: Duration,
    pub route_debounce: Duration,
    pub route_deviation_meters: f64,

    // Duplex channel
    pub accept_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,

    // Settlement
    pub default_rate_per_km: f64,
    pub min_billable_km: f64,

    // Working hours
    pub working_hours_budget: Duration,
    pub warning_thresholds: Vec<u64>, // seconds remaining, descending
    pub extension_hours: u32,
    pub expiry_policy: ExpiryPolicy,

    // Intake
    pub missing_vehicle_type_policy: MissingVehicleTypePolicy,
    pub offer_dedup_window: Duration,
    pub pending_offer_max_age: Duration,

    // Completion outbox
    pub outbox_base_delay: Duration,
    pub outbox_max_delay: Duration,
    pub outbox_poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            driver_id: "drv-local".to_string(),
            driver_name: "Driver".to_string(),
            vehicle_type: None,

            api_base_url: "http://localhost:5001".to_string(),
            osrm_url: None,
            redis_url: None,
            status_bind_addr: "127.0.0.1:3030".to_string(),

            foreground_sample_interval: Duration::from_secs(3),
            offline_sample_interval: Duration::from_secs(30),
            background_emit_interval: Duration::from_secs(10),
            location_emit_interval: Duration::from_secs(3),
            route_debounce: Duration::from_secs(2),
            route_deviation_meters: 50.0,

            accept_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(3),
            reconnect_attempts: 20,
            reconnect_base_delay: Duration::from_secs(2),
            reconnect_max_delay: Duration::from_secs(30),

            default_rate_per_km: 15.0,
            min_billable_km: 0.1,

            working_hours_budget: Duration::from_secs(12 * 3600),
            warning_thresholds: vec![3600, 1800, 600],
            extension_hours: 12,
            expiry_policy: ExpiryPolicy::WaitForCompletion,

            missing_vehicle_type_policy: MissingVehicleTypePolicy::NeverMatch,
            offer_dedup_window: Duration::from_secs(600),
            pending_offer_max_age: Duration::from_secs(60),

            outbox_base_delay: Duration::from_secs(5),
            outbox_max_delay: Duration::from_secs(300),
            outbox_poll_interval: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Load from the process environment (and `.env` if present).
    pub fn from_env() -> AgentResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Build a config from a key lookup. Keys are given without the `DRIVER_` prefix.
    pub fn from_lookup<F>(lookup: F) -> AgentResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ID") {
            config.driver_id = v;
        }
        if let Some(v) = get("NAME") {
            config.driver_name = v;
        }
        config.vehicle_type = get("VEHICLE_TYPE");

        if let Some(v) = get("API_BASE_URL") {
            config.api_base_url = v.trim_end_matches('/').to_string();
        }
        config.osrm_url = get("OSRM_URL").map(|v| v.trim_end_matches('/').to_string());
        config.redis_url = get("REDIS_URL");
        if let Some(v) = get("STATUS_BIND_ADDR") {
            config.status_bind_addr = v;
        }

        let secs = |key: &str| -> AgentResult<Option<Duration>> {
            get(key).map(|v| parse_number::<u64>(key, &v).map(Duration::from_secs)).transpose()
        };

        if let Some(d) = secs("SAMPLE_INTERVAL_SECS")? {
            config.foreground_sample_interval = d;
        }
        if let Some(d) = secs("BACKGROUND_EMIT_SECS")? {
            config.background_emit_interval = d;
        }
        if let Some(d) = secs("LOCATION_EMIT_SECS")? {
            config.location_emit_interval = d;
        }
        if let Some(d) = secs("ROUTE_DEBOUNCE_SECS")? {
            config.route_debounce = d;
        }
        if let Some(d) = secs("ACCEPT_TIMEOUT_SECS")? {
            config.accept_timeout = d;
        }
        if let Some(d) = secs("ACK_TIMEOUT_SECS")? {
            config.ack_timeout = d;
        }
        if let Some(v) = get("RECONNECT_ATTEMPTS") {
            config.reconnect_attempts = parse_number("RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("DEFAULT_RATE_PER_KM") {
            config.default_rate_per_km = parse_number("DEFAULT_RATE_PER_KM", &v)?;
        }
        if let Some(v) = get("WORKING_HOURS") {
            let hours: u64 = parse_number("WORKING_HOURS", &v)?;
            config.working_hours_budget = Duration::from_secs(hours * 3600);
        }
        if let Some(v) = get("WARNING_THRESHOLDS_SECS") {
            config.warning_thresholds = v
                .split(',')
                .map(|part| parse_number::<u64>("WARNING_THRESHOLDS_SECS", part.trim()))
                .collect::<AgentResult<Vec<_>>>()?;
        }
        if let Some(v) = get("EXTENSION_HOURS") {
            config.extension_hours = parse_number("EXTENSION_HOURS", &v)?;
        }
        if let Some(v) = get("EXPIRY_POLICY") {
            config.expiry_policy = match v.to_ascii_lowercase().as_str() {
                "preempt" => ExpiryPolicy::Preempt,
                "wait_for_completion" | "wait" => ExpiryPolicy::WaitForCompletion,
                other => {
                    return Err(AgentError::InvalidConfiguration(format!("unknown EXPIRY_POLICY '{}'", other)));
                }
            };
        }
        if let Some(v) = get("MISSING_VEHICLE_TYPE") {
            config.missing_vehicle_type_policy = match v.to_ascii_lowercase().as_str() {
                "never_match" | "never" => MissingVehicleTypePolicy::NeverMatch,
                "wildcard" => MissingVehicleTypePolicy::Wildcard,
                other => {
                    return Err(AgentError::InvalidConfiguration(format!(
                        "unknown MISSING_VEHICLE_TYPE '{}'",
                        other
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.driver_id.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration("driver id must not be empty".to_string()));
        }
        if !(self.default_rate_per_km.is_finite() && self.default_rate_per_km > 0.0) {
            return Err(AgentError::InvalidConfiguration("default rate per km must be positive".to_string()));
        }
        if self.route_debounce < Duration::from_secs(2) {
            return Err(AgentError::InvalidConfiguration("route debounce must be at least 2s".to_string()));
        }
        if self.warning_thresholds.len() > 3 {
            return Err(AgentError::InvalidConfiguration("at most 3 working-hours warnings".to_string()));
        }
        if self.warning_thresholds.windows(2).any(|w| w[0] <= w[1]) {
            return Err(AgentError::InvalidConfiguration(
                "warning thresholds must be strictly descending".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> AgentResult<T> {
    value
        .parse::<T>()
        .map_err(|_| AgentError::InvalidConfiguration(format!("{}{} is not a valid number: '{}'", ENV_PREFIX, key, value)))
}
