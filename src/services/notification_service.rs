// src/services/notification_service.rs
//! Push-notification intake.
//!
//! Push messages are a second, unordered delivery path for offers. While the
//! process is suspended an offer is parked in the store and picked up on resume.
//! Accept/reject taps on a notification are parked the same way as an intent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::errors::AgentResult;
use crate::models::ride::RideOffer;
use crate::services::state_store::{StateStoreService, StoreKeys};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub message_id: Option<String>,
    pub data: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl PushMessage {
    pub fn new(data: HashMap<String, String>, received_at: DateTime<Utc>) -> Self {
        Self {
            message_id: None,
            data,
            received_at,
        }
    }

    /// Data messages typed `rideRequest`, or untyped ones carrying a ride id.
    pub fn is_ride_request(&self) -> bool {
        match self.data.get("type").map(String::as_str) {
            Some("rideRequest") => true,
            Some(_) => false,
            None => self.data.contains_key("rideId"),
        }
    }
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Push messages delivered while the agent is running.
    fn subscribe(&self) -> broadcast::Receiver<PushMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RideAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionIntent {
    pub action: RideAction,
    pub ride_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Parked offer from a push delivered while suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRideRequest {
    pub offer: RideOffer,
    pub stored_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PushInbox {
    store: StateStoreService,
    max_age: Duration,
}

impl PushInbox {
    pub fn new(store: StateStoreService, max_age: Duration) -> Self {
        Self { store, max_age }
    }

    pub async fn park_offer(&self, offer: &RideOffer, now: DateTime<Utc>) -> AgentResult<()> {
        tracing::info!("Parking push offer {} until resume", offer.ride_id);
        let pending = PendingRideRequest {
            offer: offer.clone(),
            stored_at: now,
        };
        self.store.set_json(StoreKeys::PENDING_RIDE_REQUEST, &pending).await
    }

    /// Read-then-remove. Offers older than the max age are dropped.
    pub async fn take_offer(&self, now: DateTime<Utc>) -> AgentResult<Option<RideOffer>> {
        let pending: Option<PendingRideRequest> = self.store.take_json(StoreKeys::PENDING_RIDE_REQUEST).await?;
        let Some(pending) = pending else {
            return Ok(None);
        };

        let age = (now - pending.stored_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.max_age {
            tracing::warn!("Dropping parked offer {}: {}s old", pending.offer.ride_id, age.as_secs());
            return Ok(None);
        }
        Ok(Some(pending.offer))
    }

    pub async fn discard_offer(&self) -> AgentResult<()> {
        self.store.remove(StoreKeys::PENDING_RIDE_REQUEST).await
    }

    pub async fn record_intent(&self, action: RideAction, ride_id: &str, now: DateTime<Utc>) -> AgentResult<()> {
        let intent = ActionIntent {
            action,
            ride_id: ride_id.to_string(),
            timestamp: now,
        };
        self.store.set_json(StoreKeys::RIDE_ACTION_INTENT, &intent).await
    }

    pub async fn take_intent(&self) -> AgentResult<Option<ActionIntent>> {
        self.store.take_json(StoreKeys::RIDE_ACTION_INTENT).await
    }
}

// Mock service for development and testing
#[derive(Debug)]
pub struct MockNotificationService {
    sender: broadcast::Sender<PushMessage>,
}

impl Default for MockNotificationService {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl MockNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, data: HashMap<String, String>) {
        tracing::info!("[MOCK] Delivering push message with {} fields", data.len());
        let _ = self.sender.send(PushMessage::new(data, Utc::now()));
    }
}

#[async_trait]
impl NotificationService for MockNotificationService {
    fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.sender.subscribe()
    }
}
