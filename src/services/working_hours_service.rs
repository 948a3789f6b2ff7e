// src/services/working_hours_service.rs
//! Working-hours budget.
//!
//! Going online debits the driver's wallet server-side and starts a fixed
//! budget. The timer stores the absolute start time, so the remaining time is
//! always recomputed from the wall clock and survives suspension.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::{AgentError, AgentResult};

/// Persisted under `driverOnlineState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineState {
    pub is_online: bool,
    pub online_since: Option<DateTime<Utc>>,
    pub driver_id: String,
    pub driver_name: String,
    pub vehicle_type: Option<String>,
    pub working_hours_start_time: Option<DateTime<Utc>>,
    pub working_hours_duration: u64, // seconds, including extensions
    pub remaining_seconds: u64,
    #[serde(default)]
    pub warnings_issued: u8,
    #[serde(default)]
    pub wallet_deducted: bool,
}

impl OnlineState {
    pub fn started(
        driver_id: impl Into<String>,
        driver_name: impl Into<String>,
        vehicle_type: Option<String>,
        now: DateTime<Utc>,
        budget_seconds: u64,
    ) -> Self {
        Self {
            is_online: true,
            online_since: Some(now),
            driver_id: driver_id.into(),
            driver_name: driver_name.into(),
            vehicle_type,
            working_hours_start_time: Some(now),
            working_hours_duration: budget_seconds,
            remaining_seconds: budget_seconds,
            warnings_issued: 0,
            wallet_deducted: false,
        }
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> u64 {
        let Some(start) = self.working_hours_start_time else {
            return 0;
        };
        let elapsed = (now - start).num_seconds().max(0) as u64;
        self.working_hours_duration.saturating_sub(elapsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Warning { level: u8, remaining_seconds: u64 },
    Expired,
}

pub struct WorkingHoursTimer {
    state: OnlineState,
    thresholds: Vec<u64>,
    expiry_reported: bool,
}

impl WorkingHoursTimer {
    pub fn new(state: OnlineState, thresholds: &[u64]) -> Self {
        let mut thresholds: Vec<u64> = thresholds.iter().copied().take(3).collect();
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        Self {
            state,
            thresholds,
            expiry_reported: false,
        }
    }

    pub fn state(&self) -> &OnlineState {
        &self.state
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.state.remaining_seconds
    }

    /// Recompute from the wall clock. Emits at most one event per call.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<TimerEvent> {
        let remaining = self.state.remaining_at(now);
        self.state.remaining_seconds = remaining;

        if remaining == 0 {
            if self.expiry_reported {
                return None;
            }
            self.expiry_reported = true;
            return Some(TimerEvent::Expired);
        }

        let crossed = self.crossed(remaining);
        if crossed > self.state.warnings_issued {
            self.state.warnings_issued = crossed;
            return Some(TimerEvent::Warning {
                level: crossed,
                remaining_seconds: remaining,
            });
        }
        None
    }

    /// Add paid time. Warnings already behind the new remaining time are re-armed.
    pub fn extend(&mut self, extra: Duration, now: DateTime<Utc>) {
        self.state.working_hours_duration += extra.as_secs();
        self.state.remaining_seconds = self.state.remaining_at(now);
        self.state.warnings_issued = self.crossed(self.state.remaining_seconds);
        self.state.wallet_deducted = true;
        self.expiry_reported = false;
        tracing::info!(
            "Working hours extended by {}s, {} remaining",
            extra.as_secs(),
            format_hms(self.state.remaining_seconds)
        );
    }

    fn crossed(&self, remaining: u64) -> u8 {
        self.thresholds.iter().filter(|t| remaining <= **t).count() as u8
    }
}

/// `HH:MM:SS`; hours are not wrapped at 24.
pub fn format_hms(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingHoursReceipt {
    #[serde(default)]
    pub success: bool,
    pub remaining_seconds: Option<u64>,
    #[serde(alias = "newWalletBalance")]
    pub wallet_balance: Option<f64>,
    pub message: Option<String>,
}

#[async_trait]
pub trait WorkingHoursApi: Send + Sync {
    async fn start(&self, driver_id: &str) -> AgentResult<WorkingHoursReceipt>;
    async fn extend(&self, driver_id: &str, additional_hours: u32) -> AgentResult<WorkingHoursReceipt>;
    async fn stop(&self, driver_id: &str) -> AgentResult<()>;
}

pub struct HttpWorkingHoursApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkingHoursApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, action: &str, body: serde_json::Value) -> AgentResult<WorkingHoursReceipt> {
        let url = format!("{}/drivers/working-hours/{}", self.base_url, action);
        let response = self.client.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Working hours {} failed ({}): {}", action, status, text);
            return Err(AgentError::WorkingHoursRejected(format!("{}: {}", status, text)));
        }

        let receipt: WorkingHoursReceipt = response.json().await?;
        if !receipt.success {
            let reason = receipt.message.clone().unwrap_or_else(|| "request declined".to_string());
            return Err(AgentError::WorkingHoursRejected(reason));
        }
        Ok(receipt)
    }
}

#[async_trait]
impl WorkingHoursApi for HttpWorkingHoursApi {
    async fn start(&self, driver_id: &str) -> AgentResult<WorkingHoursReceipt> {
        tracing::info!("Starting working hours for driver: {}", driver_id);
        self.post("start", json!({ "driverId": driver_id })).await
    }

    async fn extend(&self, driver_id: &str, additional_hours: u32) -> AgentResult<WorkingHoursReceipt> {
        tracing::info!("Extending working hours by {}h for driver: {}", additional_hours, driver_id);
        self.post("extend", json!({ "driverId": driver_id, "additionalHours": additional_hours }))
            .await
    }

    async fn stop(&self, driver_id: &str) -> AgentResult<()> {
        tracing::info!("Stopping working hours for driver: {}", driver_id);
        self.post("stop", json!({ "driverId": driver_id })).await.map(|_| ())
    }
}

// Mock service for development and testing
#[derive(Debug, Default)]
pub struct MockWorkingHoursApi {
    reject_start: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockWorkingHoursApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(reason: &str) -> Self {
        let api = Self::default();
        if let Ok(mut reject) = api.reject_start.lock() {
            *reject = Some(reason.to_string());
        }
        api
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl WorkingHoursApi for MockWorkingHoursApi {
    async fn start(&self, driver_id: &str) -> AgentResult<WorkingHoursReceipt> {
        self.record(format!("start:{}", driver_id));
        if let Some(reason) = self.reject_start.lock().ok().and_then(|r| r.clone()) {
            return Err(AgentError::WorkingHoursRejected(reason));
        }
        tracing::info!("[MOCK] Working hours started for driver: {}", driver_id);
        Ok(WorkingHoursReceipt {
            success: true,
            ..Default::default()
        })
    }

    async fn extend(&self, driver_id: &str, additional_hours: u32) -> AgentResult<WorkingHoursReceipt> {
        self.record(format!("extend:{}:{}", driver_id, additional_hours));
        tracing::info!("[MOCK] Working hours extended by {}h for driver: {}", additional_hours, driver_id);
        Ok(WorkingHoursReceipt {
            success: true,
            ..Default::default()
        })
    }

    async fn stop(&self, driver_id: &str) -> AgentResult<()> {
        self.record(format!("stop:{}", driver_id));
        tracing::info!("[MOCK] Working hours stopped for driver: {}", driver_id);
        Ok(())
    }
}
