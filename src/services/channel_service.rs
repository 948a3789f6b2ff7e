// src/services/channel_service.rs
//! Duplex channel to the dispatch server.
//!
//! [`ChannelTransport`] is the raw socket seam (connect, emit, request with
//! acknowledgement, inbound stream). [`DispatchChannel`] layers the agent's
//! rules on top: reconnect with capped backoff, fail-fast emits while
//! disconnected, and the accept request with its single retry.

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::models::events::{AcceptRequest, AcceptResponse, RawChannelEvent, names};

/// Connection lifecycle and inbound traffic, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Connected,
    Disconnected(String),
    Event(RawChannelEvent),
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self) -> AgentResult<()>;
    fn is_connected(&self) -> bool;
    /// Fire-and-forget emit.
    async fn emit(&self, event: &str, payload: Value) -> AgentResult<()>;
    /// Emit and wait for the server's acknowledgement. Callers bound the wait.
    async fn request(&self, event: &str, payload: Value) -> AgentResult<Value>;
    fn subscribe(&self) -> broadcast::Receiver<ChannelSignal>;
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// `None` retries forever (background mode).
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn foreground(config: &AgentConfig) -> Self {
        Self {
            max_attempts: Some(config.reconnect_attempts),
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
        }
    }

    pub fn background(config: &AgentConfig) -> Self {
        Self {
            max_attempts: None,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
        }
    }

    /// Exponential backoff capped at `max_delay`, with up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_with_jitter(self.base_delay, self.max_delay, attempt)
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

pub fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    let capped = base.saturating_mul(factor).min(max);
    let jitter_ms = (capped.as_millis() as u64) / 5;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    capped.saturating_sub(jitter)
}

pub struct DispatchChannel {
    transport: Arc<dyn ChannelTransport>,
    policy: ReconnectPolicy,
    accept_timeout: Duration,
    ack_timeout: Duration,
}

impl DispatchChannel {
    pub fn new(transport: Arc<dyn ChannelTransport>, config: &AgentConfig) -> Self {
        Self {
            transport,
            policy: ReconnectPolicy::foreground(config),
            accept_timeout: config.accept_timeout,
            ack_timeout: config.ack_timeout,
        }
    }

    /// Same transport under a different reconnect policy.
    pub fn with_policy(&self, policy: ReconnectPolicy) -> Self {
        Self {
            transport: self.transport.clone(),
            policy,
            accept_timeout: self.accept_timeout,
            ack_timeout: self.ack_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
        self.transport.subscribe()
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Connect if needed, retrying under the reconnect policy.
    pub async fn ensure_connected(&self) -> AgentResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match self.transport.connect().await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::info!("Dispatch channel reconnected after {} attempts", attempt + 1);
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if !self.policy.allows(attempt) {
                        tracing::error!("Giving up on dispatch channel after {} attempts: {}", attempt, e);
                        return Err(AgentError::ChannelUnavailable(e.to_string()));
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    tracing::warn!("Dispatch channel connect failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Emit without queueing. Fails immediately while disconnected.
    pub async fn emit<T: Serialize>(&self, event: &str, payload: &T) -> AgentResult<()> {
        if !self.transport.is_connected() {
            tracing::debug!("Dropping {} emit, channel disconnected", event);
            return Err(AgentError::ChannelClosed);
        }
        let value = serde_json::to_value(payload)?;
        self.transport.emit(event, value).await
    }

    /// Emit and wait up to `timeout` for the acknowledgement.
    pub async fn request_ack<T: Serialize>(&self, event: &str, payload: &T, timeout: Duration) -> AgentResult<Value> {
        if !self.transport.is_connected() {
            return Err(AgentError::ChannelClosed);
        }
        let value = serde_json::to_value(payload)?;
        tokio::time::timeout(timeout, self.transport.request(event, value)).await?
    }

    /// Request the ride. On a connectivity failure, reconnect and retry exactly once.
    pub async fn accept_ride(&self, request: &AcceptRequest) -> AgentResult<AcceptResponse> {
        match self.try_accept(request).await {
            Err(e) if e.is_connectivity() => {
                tracing::warn!("Accept for ride {} failed ({}), reconnecting for one retry", request.ride_id, e);
                self.reconnect_once().await?;
                self.try_accept(request).await.map_err(|e| {
                    if e.is_connectivity() {
                        AgentError::ChannelUnavailable(format!("accept for ride {} failed after retry: {}", request.ride_id, e))
                    } else {
                        e
                    }
                })
            }
            other => other,
        }
    }

    /// A single connect attempt, bounded by the accept timeout.
    async fn reconnect_once(&self) -> AgentResult<()> {
        let single = self.with_policy(ReconnectPolicy {
            max_attempts: Some(1),
            ..self.policy.clone()
        });
        match tokio::time::timeout(self.accept_timeout, single.ensure_connected()).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::ChannelUnavailable("reconnect timed out".to_string())),
        }
    }

    async fn try_accept(&self, request: &AcceptRequest) -> AgentResult<AcceptResponse> {
        let ack = self.request_ack(names::ACCEPT_RIDE, request, self.accept_timeout).await?;
        serde_json::from_value(ack).map_err(|e| AgentError::JsonParsing(e.to_string()))
    }
}

type ScriptedReply = AgentResult<Value>;

/// In-process transport. Records emits and replays scripted acknowledgements.
pub struct MockChannelTransport {
    connected: AtomicBool,
    connect_failures_left: AtomicU32,
    connect_attempts: AtomicU32,
    refuse_connect: AtomicBool,
    ack_delay: Mutex<Option<Duration>>,
    emitted: Mutex<Vec<RawChannelEvent>>,
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    signals: broadcast::Sender<ChannelSignal>,
}

impl Default for MockChannelTransport {
    fn default() -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            connected: AtomicBool::new(false),
            connect_failures_left: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            refuse_connect: AtomicBool::new(false),
            ack_delay: Mutex::new(None),
            emitted: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            signals,
        }
    }
}

impl MockChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// Queue the acknowledgement for the next `request` of `event`.
    pub fn reply_with(&self, event: &str, reply: AgentResult<Value>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(event.to_string()).or_default().push_back(reply);
        }
    }

    /// Hold every acknowledgement for `delay` (longer than the timeout simulates a lost ack).
    pub fn delay_acks(&self, delay: Duration) {
        if let Ok(mut d) = self.ack_delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.signals.send(ChannelSignal::Disconnected(reason.to_string()));
    }

    /// Deliver an inbound server event to subscribers.
    pub fn inject(&self, event: &str, payload: Value) {
        let _ = self.signals.send(ChannelSignal::Event(RawChannelEvent::new(event, payload)));
    }

    pub fn emitted(&self) -> Vec<RawChannelEvent> {
        self.emitted.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn emitted_named(&self, event: &str) -> Vec<Value> {
        self.emitted()
            .into_iter()
            .filter(|e| e.name == event)
            .map(|e| e.payload)
            .collect()
    }

    fn record(&self, event: &str, payload: Value) {
        if let Ok(mut emitted) = self.emitted.lock() {
            emitted.push(RawChannelEvent::new(event, payload));
        }
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn connect(&self) -> AgentResult<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(AgentError::NetworkConnection("connection refused".to_string()));
        }
        let left = self.connect_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.connect_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(AgentError::NetworkConnection("connection refused".to_string()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("[MOCK] Dispatch channel connected");
            let _ = self.signals.send(ChannelSignal::Connected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: &str, payload: Value) -> AgentResult<()> {
        if !self.is_connected() {
            return Err(AgentError::ChannelClosed);
        }
        tracing::debug!("[MOCK] emit {}", event);
        self.record(event, payload);
        Ok(())
    }

    async fn request(&self, event: &str, payload: Value) -> AgentResult<Value> {
        if !self.is_connected() {
            return Err(AgentError::ChannelClosed);
        }
        self.record(event, payload);

        let delay = self.ack_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.get_mut(event).and_then(VecDeque::pop_front));
        scripted.unwrap_or_else(|| Ok(serde_json::json!({ "success": true })))
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_config() -> AgentConfig {
        AgentConfig {
            reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(1),
            reconnect_max_delay: Duration::from_millis(5),
            accept_timeout: Duration::from_millis(50),
            ..AgentConfig::default()
        }
    }

    fn request() -> AcceptRequest {
        AcceptRequest {
            ride_id: "R1".to_string(),
            driver_id: "drv-1".to_string(),
            driver_name: "Ravi".to_string(),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        let first = backoff_with_jitter(base, max, 0);
        assert!(first <= base && first >= base.mul_f64(0.8));
        assert!(backoff_with_jitter(base, max, 10) <= max);
    }

    #[tokio::test]
    async fn emit_fails_fast_while_disconnected() {
        let transport = Arc::new(MockChannelTransport::new());
        let channel = DispatchChannel::new(transport.clone(), &fast_config());
        let result = channel.emit(names::DRIVER_LOCATION_UPDATE, &json!({})).await;
        assert!(matches!(result, Err(AgentError::ChannelClosed)));
        assert!(transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_bounded_attempts() {
        let transport = Arc::new(MockChannelTransport::new());
        transport.refuse_connections(true);
        let channel = DispatchChannel::new(transport, &fast_config());
        assert!(matches!(channel.ensure_connected().await, Err(AgentError::ChannelUnavailable(_))));
    }

    #[tokio::test]
    async fn reconnect_succeeds_after_transient_failures() {
        let transport = Arc::new(MockChannelTransport::new());
        transport.fail_next_connects(2);
        let channel = DispatchChannel::new(transport.clone(), &fast_config());
        channel.ensure_connected().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn accept_parses_the_acknowledgement() {
        let transport = Arc::new(MockChannelTransport::connected());
        transport.reply_with(
            names::ACCEPT_RIDE,
            Ok(json!({"success": true, "userName": "Asha", "pickup": {"lat": 1.0, "lng": 2.0}})),
        );
        let channel = DispatchChannel::new(transport.clone(), &fast_config());

        let response = channel.accept_ride(&request()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.user_name.as_deref(), Some("Asha"));
        assert_eq!(transport.emitted_named(names::ACCEPT_RIDE).len(), 1);
    }

    #[tokio::test]
    async fn accept_retries_once_after_a_timeout() {
        let transport = Arc::new(MockChannelTransport::connected());
        transport.delay_acks(Duration::from_millis(200));
        let channel = DispatchChannel::new(transport.clone(), &fast_config());

        let result = channel.accept_ride(&request()).await;
        assert!(matches!(result, Err(AgentError::ChannelUnavailable(_))));
        assert_eq!(transport.emitted_named(names::ACCEPT_RIDE).len(), 2);
    }

    #[tokio::test]
    async fn accept_surfaces_unavailable_when_reconnect_fails() {
        let transport = Arc::new(MockChannelTransport::new());
        transport.refuse_connections(true);
        let channel = DispatchChannel::new(transport.clone(), &fast_config());

        let result = channel.accept_ride(&request()).await;
        assert!(matches!(result, Err(AgentError::ChannelUnavailable(_))));
        assert!(transport.emitted().is_empty());
    }

    #[tokio::test]
    async fn accept_reconnects_only_once_under_default_timings() {
        let transport = Arc::new(MockChannelTransport::new());
        transport.refuse_connections(true);
        let channel = DispatchChannel::new(transport.clone(), &AgentConfig::default());

        let result = tokio::time::timeout(Duration::from_secs(2), channel.accept_ride(&request()))
            .await
            .expect("accept should not wait out the foreground reconnect policy");
        assert!(matches!(result, Err(AgentError::ChannelUnavailable(_))));
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn accept_retries_after_a_single_reconnect() {
        let transport = Arc::new(MockChannelTransport::new());
        let channel = DispatchChannel::new(transport.clone(), &AgentConfig::default());

        let response = tokio::time::timeout(Duration::from_secs(2), channel.accept_ride(&request()))
            .await
            .unwrap()
            .unwrap();
        assert!(response.success);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(transport.emitted_named(names::ACCEPT_RIDE).len(), 1);
    }
}
