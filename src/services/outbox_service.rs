// src/services/outbox_service.rs
//! Reliable delivery of ride completions.
//!
//! Every completion is written to the store before the first attempt and only
//! removed once a transport confirms it. Attempts try the duplex channel
//! (acknowledged emit) first and the HTTP endpoint second; failures back off
//! with jitter and survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{AgentError, AgentResult};
use crate::models::events::{RideCompletedPayload, names};
use crate::services::channel_service::{DispatchChannel, backoff_with_jitter};
use crate::services::state_store::{StateStoreService, StoreKeys};
use crate::utils::tasks::TaskGuard;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: Uuid,
    pub ride_id: String,
    pub payload: RideCompletedPayload,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    Channel,
    Http,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: Vec<String>,
    pub pending: usize,
}

/// `POST {api}/api/rides/complete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub ride_id: String,
    pub driver_id: String,
    pub distance: f64,
    pub fare: i64,
}

impl From<&RideCompletedPayload> for CompletionRequest {
    fn from(payload: &RideCompletedPayload) -> Self {
        Self {
            ride_id: payload.ride_id.clone(),
            driver_id: payload.driver_id.clone(),
            distance: payload.distance,
            fare: payload.fare,
        }
    }
}

#[async_trait]
pub trait CompletionApi: Send + Sync {
    async fn complete_ride(&self, request: &CompletionRequest) -> AgentResult<()>;
}

pub struct HttpCompletionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompletionApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to build completion HTTP client ({}), using defaults", e);
                    reqwest::Client::new()
                }),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CompletionApi for HttpCompletionApi {
    async fn complete_ride(&self, request: &CompletionRequest) -> AgentResult<()> {
        let url = format!("{}/api/rides/complete", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::DeliveryFailed(format!("{}: {}", status, text)));
        }
        Ok(())
    }
}

// Mock service for development and testing
#[derive(Debug, Default)]
pub struct MockCompletionApi {
    failing: StdMutex<bool>,
    delivered: StdMutex<Vec<CompletionRequest>>,
}

impl MockCompletionApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut f) = self.failing.lock() {
            *f = failing;
        }
    }

    pub fn delivered(&self) -> Vec<CompletionRequest> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionApi for MockCompletionApi {
    async fn complete_ride(&self, request: &CompletionRequest) -> AgentResult<()> {
        if self.failing.lock().map(|f| *f).unwrap_or(false) {
            return Err(AgentError::NetworkConnection("completion endpoint unreachable".to_string()));
        }
        tracing::info!("[MOCK] Completion delivered over HTTP for ride: {}", request.ride_id);
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(request.clone());
        }
        Ok(())
    }
}

pub struct CompletionOutbox {
    store: StateStoreService,
    channel: Arc<DispatchChannel>,
    http: Arc<dyn CompletionApi>,
    base_delay: Duration,
    max_delay: Duration,
    // Serializes read-modify-write of the persisted queue. Never held across delivery attempts.
    lock: Mutex<()>,
    // One flush at a time, so an entry is never attempted twice concurrently.
    flushing: Mutex<()>,
}

impl CompletionOutbox {
    pub fn new(
        store: StateStoreService,
        channel: Arc<DispatchChannel>,
        http: Arc<dyn CompletionApi>,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            http,
            base_delay,
            max_delay,
            lock: Mutex::new(()),
            flushing: Mutex::new(()),
        }
    }

    /// Persist a completion. Returns the entry id.
    pub async fn enqueue(&self, payload: RideCompletedPayload, now: DateTime<Utc>) -> AgentResult<Uuid> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;

        if let Some(existing) = entries.iter().find(|e| e.ride_id == payload.ride_id) {
            tracing::debug!("Completion for ride {} already queued", payload.ride_id);
            return Ok(existing.id);
        }

        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            ride_id: payload.ride_id.clone(),
            payload,
            attempts: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_error: None,
        };
        let id = entry.id;
        tracing::info!("Queued completion {} for ride {}", id, entry.ride_id);
        entries.push(entry);
        self.save(&entries).await?;
        Ok(id)
    }

    pub async fn pending(&self) -> AgentResult<Vec<OutboxEntry>> {
        self.load().await
    }

    /// Attempt every entry that is due. Delivered entries are removed.
    ///
    /// The queue is only locked to snapshot due entries and to merge the
    /// outcomes back, so `enqueue` never waits on a slow transport.
    pub async fn flush(&self, now: DateTime<Utc>) -> AgentResult<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let due: Vec<OutboxEntry> = {
            let _guard = self.lock.lock().await;
            self.load().await?.into_iter().filter(|e| e.next_attempt_at <= now).collect()
        };

        let mut report = FlushReport::default();
        let mut delivered = Vec::new();
        let mut retries = Vec::new();
        for mut entry in due {
            match self.attempt(&entry).await {
                Ok(route) => {
                    tracing::info!("Completion for ride {} delivered via {:?}", entry.ride_id, route);
                    delivered.push(entry.id);
                    report.delivered.push(entry.ride_id);
                }
                Err(e) => {
                    entry.attempts += 1;
                    let delay = backoff_with_jitter(self.base_delay, self.max_delay, entry.attempts - 1);
                    entry.next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(5));
                    entry.last_error = Some(e.to_string());
                    tracing::warn!(
                        "Completion for ride {} failed (attempt {}): {}, retrying in {:?}",
                        entry.ride_id,
                        entry.attempts,
                        e,
                        delay
                    );
                    retries.push(entry);
                }
            }
        }

        let _guard = self.lock.lock().await;
        let entries = self.load().await?;
        if entries.is_empty() && report.delivered.is_empty() {
            return Ok(report);
        }
        // Entries enqueued while delivering are kept untouched.
        let remaining: Vec<OutboxEntry> = entries
            .into_iter()
            .filter(|e| !delivered.contains(&e.id))
            .map(|e| match retries.iter().find(|r| r.id == e.id) {
                Some(updated) => updated.clone(),
                None => e,
            })
            .collect();
        report.pending = remaining.len();
        self.save(&remaining).await?;
        Ok(report)
    }

    async fn attempt(&self, entry: &OutboxEntry) -> AgentResult<DeliveryRoute> {
        match self.send_over_channel(&entry.payload).await {
            Ok(()) => return Ok(DeliveryRoute::Channel),
            Err(e) => tracing::debug!("Channel delivery for ride {} failed: {}", entry.ride_id, e),
        }
        self.http.complete_ride(&CompletionRequest::from(&entry.payload)).await?;
        Ok(DeliveryRoute::Http)
    }

    async fn send_over_channel(&self, payload: &RideCompletedPayload) -> AgentResult<()> {
        let ack = self
            .channel
            .request_ack(names::DRIVER_COMPLETED_RIDE, payload, self.channel.ack_timeout())
            .await?;
        if ack.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            let message = ack.get("message").and_then(Value::as_str).unwrap_or("not acknowledged");
            Err(AgentError::DeliveryFailed(message.to_string()))
        }
    }

    pub fn spawn_retry_loop(self: Arc<Self>, interval: Duration) -> TaskGuard {
        TaskGuard::spawn("completion-outbox", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush(Utc::now()).await {
                    tracing::warn!("Completion outbox flush failed: {}", e);
                }
            }
        })
    }

    async fn load(&self) -> AgentResult<Vec<OutboxEntry>> {
        Ok(self
            .store
            .get_json::<Vec<OutboxEntry>>(StoreKeys::PENDING_RIDE_COMPLETION)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, entries: &[OutboxEntry]) -> AgentResult<()> {
        if entries.is_empty() {
            self.store.remove(StoreKeys::PENDING_RIDE_COMPLETION).await
        } else {
            self.store.set_json(StoreKeys::PENDING_RIDE_COMPLETION, entries).await
        }
    }
}
