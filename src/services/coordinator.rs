// src/services/coordinator.rs
//! The ride coordinator.
//!
//! One task owns all mutable agent state and consumes a single queue of
//! [`AgentEvent`]s: channel traffic, push messages, location samples, driver
//! commands, results of spawned I/O and the 1 s timer tick. Spawned work posts
//! its result back tagged with the ride id it started for, and results for a
//! ride that is no longer in the slot are dropped on arrival.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, ExpiryPolicy};
use crate::errors::{AgentError, AgentResult};
use crate::models::agent::{AgentState, DriverStatus};
use crate::models::events::{
    AcceptResponse, DriverAcceptedPayload, InboundEvent, LocationUpdatePayload, OtpVerifiedPayload, RawChannelEvent,
    RegisterDriverPayload, RejectRidePayload, RideCancelledPayload, RideCompletedPayload, RideStatusUpdatePayload,
    RideTakenPayload, names,
};
use crate::models::location::{Coordinate, LocationSample, RouteCoords};
use crate::models::ride::{ActiveRide, RideOffer, RideStatus, Settlement};
use crate::models::status::{AgentView, Notice, RideView, StatusSnapshot};
use crate::services::channel_service::{ChannelSignal, DispatchChannel, ReconnectPolicy};
use crate::services::dispatch_service::{Admission, DispatchIntake, RaceOutcome};
use crate::services::notification_service::{ActionIntent, NotificationService, PushInbox, PushMessage, RideAction};
use crate::services::outbox_service::CompletionOutbox;
use crate::services::persistence_service::{Recovered, RidePersistence};
use crate::services::ride_lifecycle::{AcceptOutcome, RideLifecycle, Tariff};
use crate::services::route_service::RoutePlanner;
use crate::services::state_store::{StateStoreService, StoreKeys};
use crate::services::tracking_service::{
    BackgroundEmitter, EmitThrottle, LocationSampler, RouteLeg, RouteRefreshGate, SamplerOptions, spawn_sampling,
};
use crate::services::working_hours_service::{OnlineState, TimerEvent, WorkingHoursApi, WorkingHoursTimer, format_hms};
use crate::utils::tasks::TaskGuard;

const EVENT_QUEUE_DEPTH: usize = 256;
const HOURS_API_TIMEOUT: Duration = Duration::from_secs(15);

pub type Reply<T> = oneshot::Sender<AgentResult<T>>;

#[derive(Debug)]
pub enum DriverCommand {
    GoOnline(Reply<()>),
    GoOffline(Reply<()>),
    ExtendHours(Reply<u64>),
    Accept(Reply<RideStatus>),
    Reject(Reply<()>),
    VerifyOtp(String, Reply<()>),
    Complete(Reply<Settlement>),
    AcknowledgeSettlement(Reply<()>),
    SetRiderDetailsVisible(bool, Reply<()>),
    NotificationAction(RideAction, String, Reply<()>),
    EnterBackground(Reply<()>),
    EnterForeground(Reply<()>),
    Shutdown(Reply<()>),
}

#[derive(Debug)]
pub enum AgentEvent {
    Channel(ChannelSignal),
    Push(PushMessage),
    Sample(LocationSample),
    Command(DriverCommand),
    AcceptResolved { ride_id: String, result: AgentResult<AcceptResponse> },
    RouteFetched { ride_id: String, leg: RouteLeg, route: AgentResult<RouteCoords> },
    Tick(DateTime<Utc>),
}

/// Everything the coordinator talks to.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub config: Arc<AgentConfig>,
    pub channel: Arc<DispatchChannel>,
    pub store: StateStoreService,
    pub routes: Arc<dyn RoutePlanner>,
    pub sampler: Arc<dyn LocationSampler>,
    pub notifications: Arc<dyn NotificationService>,
    pub hours_api: Arc<dyn WorkingHoursApi>,
    pub outbox: Arc<CompletionOutbox>,
}

/// Cloneable front door used by the presentation layer.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<AgentEvent>,
    status: watch::Receiver<StatusSnapshot>,
}

impl CoordinatorHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> DriverCommand) -> AgentResult<T> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(AgentEvent::Command(command(tx)))
            .await
            .map_err(|_| AgentError::CoordinatorStopped)?;
        rx.await.map_err(|_| AgentError::CoordinatorStopped)?
    }

    pub async fn go_online(&self) -> AgentResult<()> {
        self.call(DriverCommand::GoOnline).await
    }

    pub async fn go_offline(&self) -> AgentResult<()> {
        self.call(DriverCommand::GoOffline).await
    }

    /// Returns the remaining working seconds after the extension.
    pub async fn extend_hours(&self) -> AgentResult<u64> {
        self.call(DriverCommand::ExtendHours).await
    }

    /// Resolves once the server answered (or the retry was exhausted).
    pub async fn accept(&self) -> AgentResult<RideStatus> {
        self.call(DriverCommand::Accept).await
    }

    pub async fn reject(&self) -> AgentResult<()> {
        self.call(DriverCommand::Reject).await
    }

    pub async fn verify_otp(&self, code: &str) -> AgentResult<()> {
        let code = code.to_string();
        self.call(|reply| DriverCommand::VerifyOtp(code, reply)).await
    }

    pub async fn complete(&self) -> AgentResult<Settlement> {
        self.call(DriverCommand::Complete).await
    }

    pub async fn acknowledge_settlement(&self) -> AgentResult<()> {
        self.call(DriverCommand::AcknowledgeSettlement).await
    }

    pub async fn set_rider_details_visible(&self, visible: bool) -> AgentResult<()> {
        self.call(|reply| DriverCommand::SetRiderDetailsVisible(visible, reply)).await
    }

    pub async fn notification_action(&self, action: RideAction, ride_id: &str) -> AgentResult<()> {
        let ride_id = ride_id.to_string();
        self.call(|reply| DriverCommand::NotificationAction(action, ride_id, reply)).await
    }

    pub async fn enter_background(&self) -> AgentResult<()> {
        self.call(DriverCommand::EnterBackground).await
    }

    pub async fn enter_foreground(&self) -> AgentResult<()> {
        self.call(DriverCommand::EnterForeground).await
    }

    pub async fn shutdown(&self) -> AgentResult<()> {
        self.call(DriverCommand::Shutdown).await
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> AgentResult<StatusSnapshot>
    where
        F: FnMut(&StatusSnapshot) -> bool,
    {
        let mut rx = self.status.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| AgentError::CoordinatorStopped)?;
        Ok(snapshot.clone())
    }
}

pub struct RideCoordinator {
    config: Arc<AgentConfig>,
    deps: CoordinatorDeps,
    persistence: RidePersistence,
    inbox: PushInbox,
    tariff: Tariff,

    agent: AgentState,
    lifecycle: RideLifecycle,
    intake: DispatchIntake,
    timer: Option<WorkingHoursTimer>,
    offline_pending: bool,
    backgrounded: bool,

    last_sample: Option<LocationSample>,
    emit_throttle: EmitThrottle,
    route_gate: RouteRefreshGate,
    pending_accept: Option<(String, Option<Reply<RideStatus>>)>,
    notice: Option<Notice>,
    revision: u64,

    events_tx: mpsc::Sender<AgentEvent>,
    status_tx: watch::Sender<StatusSnapshot>,

    sampling_task: Option<TaskGuard>,
    route_task: Option<TaskGuard>,
    reconnect_task: Option<TaskGuard>,
    background_task: Option<TaskGuard>,
    outbox_task: Option<TaskGuard>,
    forwarders: Vec<TaskGuard>,
}

impl RideCoordinator {
    /// Recover persisted state, start the coordinator task and return its handle.
    pub async fn spawn(deps: CoordinatorDeps) -> AgentResult<(CoordinatorHandle, JoinHandle<()>)> {
        deps.config.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let mut coordinator = Self::new(deps, events_tx.clone());
        let status_rx = coordinator.status_tx.subscribe();

        // Subscribe before connecting so the first Connected signal is not missed.
        coordinator.start_forwarders();
        coordinator.recover(Utc::now()).await;
        coordinator.start_outbox();
        coordinator.spawn_reconnect();
        coordinator.publish();

        let join = tokio::spawn(coordinator.run(events_rx));
        Ok((
            CoordinatorHandle {
                events: events_tx,
                status: status_rx,
            },
            join,
        ))
    }

    fn new(deps: CoordinatorDeps, events_tx: mpsc::Sender<AgentEvent>) -> Self {
        let config = deps.config.clone();
        let agent = AgentState::new(&config.driver_id, &config.driver_name, config.vehicle_type.clone());
        let intake = DispatchIntake::new(
            config.vehicle_type.as_deref(),
            config.missing_vehicle_type_policy,
            config.offer_dedup_window,
        );
        let (status_tx, _) = watch::channel(Self::empty_snapshot(&agent));

        Self {
            persistence: RidePersistence::new(deps.store.clone()),
            inbox: PushInbox::new(deps.store.clone(), config.pending_offer_max_age),
            tariff: Tariff {
                default_rate_per_km: config.default_rate_per_km,
                min_billable_km: config.min_billable_km,
            },
            agent,
            lifecycle: RideLifecycle::new(),
            intake,
            timer: None,
            offline_pending: false,
            backgrounded: false,
            last_sample: None,
            emit_throttle: EmitThrottle::new(config.location_emit_interval),
            route_gate: RouteRefreshGate::new(config.route_debounce, config.route_deviation_meters),
            pending_accept: None,
            notice: None,
            revision: 0,
            events_tx,
            status_tx,
            sampling_task: None,
            route_task: None,
            reconnect_task: None,
            background_task: None,
            outbox_task: None,
            forwarders: Vec::new(),
            config,
            deps,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<AgentEvent>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(AgentEvent::Command(DriverCommand::Shutdown(reply))) => {
                        self.shutdown().await;
                        self.respond(reply, Ok(()));
                        break;
                    }
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.handle(AgentEvent::Tick(Utc::now())).await,
            }
            self.publish();
        }
        tracing::info!("Ride coordinator stopped");
    }

    async fn handle(&mut self, event: AgentEvent) {
        let now = Utc::now();
        match event {
            AgentEvent::Channel(signal) => self.on_channel_signal(signal, now).await,
            AgentEvent::Push(message) => self.on_push(message, now).await,
            AgentEvent::Sample(sample) => self.on_sample(sample, now).await,
            AgentEvent::Command(command) => {
                self.notice = None;
                self.on_command(command, now).await;
            }
            AgentEvent::AcceptResolved { ride_id, result } => self.on_accept_resolved(ride_id, result, now).await,
            AgentEvent::RouteFetched { ride_id, leg, route } => self.on_route_fetched(ride_id, leg, route),
            AgentEvent::Tick(at) => self.on_tick(at).await,
        }
    }

    // ---------------------------------------------------------------------
    // Startup
    // ---------------------------------------------------------------------

    async fn recover(&mut self, now: DateTime<Utc>) {
        match self.deps.store.get_json::<OnlineState>(StoreKeys::DRIVER_ONLINE_STATE).await {
            Ok(Some(state)) if state.is_online => {
                tracing::info!(
                    "Resuming online session for driver {} ({} left)",
                    state.driver_id,
                    format_hms(state.remaining_at(now))
                );
                self.timer = Some(WorkingHoursTimer::new(state, &self.config.warning_thresholds));
                self.agent.online = true;
                self.agent.status = DriverStatus::Online;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not read online state: {}", e),
        }

        match self.persistence.load().await {
            Ok(Recovered::Restored(ride)) => {
                self.agent.status = DriverStatus::OnRide;
                self.lifecycle = RideLifecycle::restore(ride);
            }
            Ok(Recovered::DiscardedCompleted(ride_id)) => {
                tracing::info!("Completed ride {} was not restored", ride_id);
            }
            Ok(Recovered::Nothing) => {}
            Err(e) => tracing::warn!("Could not read ride state: {}", e),
        }

        self.restart_sampling();
        self.resume_parked_work(now).await;
    }

    async fn resume_parked_work(&mut self, now: DateTime<Utc>) {
        match self.inbox.take_offer(now).await {
            Ok(Some(offer)) => self.intake_offer(offer, now),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read parked offer: {}", e),
        }
        match self.inbox.take_intent().await {
            Ok(Some(intent)) => self.apply_intent(intent),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read notification action: {}", e),
        }
    }

    fn start_forwarders(&mut self) {
        let mut channel_rx = self.deps.channel.subscribe();
        let tx = self.events_tx.clone();
        self.forwarders.push(TaskGuard::spawn("channel-forwarder", async move {
            loop {
                match channel_rx.recv().await {
                    Ok(signal) => {
                        if tx.send(AgentEvent::Channel(signal)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Channel forwarder lagged, {} events dropped", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut push_rx = self.deps.notifications.subscribe();
        let tx = self.events_tx.clone();
        self.forwarders.push(TaskGuard::spawn("push-forwarder", async move {
            loop {
                match push_rx.recv().await {
                    Ok(message) => {
                        if tx.send(AgentEvent::Push(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Push forwarder lagged, {} messages dropped", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn start_outbox(&mut self) {
        let outbox = self.deps.outbox.clone();
        self.outbox_task = Some(outbox.spawn_retry_loop(self.config.outbox_poll_interval));
    }

    async fn shutdown(&mut self) {
        self.persist_current().await;
        self.save_online_state().await;
        self.sampling_task = None;
        self.route_task = None;
        self.reconnect_task = None;
        self.background_task = None;
        self.outbox_task = None;
        self.forwarders.clear();
    }

    // ---------------------------------------------------------------------
    // Duplex channel
    // ---------------------------------------------------------------------

    async fn on_channel_signal(&mut self, signal: ChannelSignal, now: DateTime<Utc>) {
        match signal {
            ChannelSignal::Connected => {
                tracing::info!("Dispatch channel connected");
                if self.agent.online {
                    self.register_driver().await;
                }
                self.flush_outbox_now();
            }
            ChannelSignal::Disconnected(reason) => {
                tracing::warn!("Dispatch channel lost: {}", reason);
                self.notice = Some(Notice::ConnectionLost);
                self.spawn_reconnect();
            }
            ChannelSignal::Event(raw) => self.on_channel_event(raw, now).await,
        }
    }

    fn spawn_reconnect(&mut self) {
        if self.reconnect_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let channel = self.deps.channel.clone();
        self.reconnect_task = Some(TaskGuard::spawn("channel-reconnect", async move {
            if let Err(e) = channel.ensure_connected().await {
                tracing::error!("Dispatch channel unavailable: {}", e);
            }
        }));
    }

    async fn register_driver(&self) {
        let position = self.position();
        let payload = RegisterDriverPayload {
            driver_id: self.agent.driver_id.clone(),
            driver_name: self.agent.driver_name.clone(),
            latitude: position.map(|p| p.latitude),
            longitude: position.map(|p| p.longitude),
            vehicle_type: self.intake.vehicle_type().map(str::to_string),
            status: self.agent.status.as_str().to_string(),
        };
        self.emit(names::REGISTER_DRIVER, &payload).await;
    }

    async fn on_channel_event(&mut self, raw: RawChannelEvent, now: DateTime<Utc>) {
        let Some(event) = InboundEvent::parse(&raw) else {
            tracing::warn!("Ignoring channel event {}: unknown or incomplete", raw.name);
            return;
        };

        match event {
            InboundEvent::NewRideRequest(payload) => match RideOffer::from_channel_payload(&payload, now) {
                Ok(offer) => self.intake_offer(offer, now),
                Err(e) => tracing::warn!("Dropping channel offer: {}", e),
            },
            InboundEvent::RideCancelled { ride_id } => {
                if self.lifecycle.discard(&ride_id).is_some() {
                    tracing::info!("Ride {} cancelled by dispatch", ride_id);
                    self.notice = Some(Notice::RideCancelled {
                        ride_id: ride_id.clone(),
                    });
                    self.ride_ended(true).await;
                    self.fail_pending_accept(&ride_id, AgentError::RideNotCurrent(ride_id.clone()));
                } else {
                    tracing::debug!("Cancellation for ride {} does not match the slot", ride_id);
                }
            }
            InboundEvent::RideTakenByDriver {
                ride_id,
                driver_id,
                message,
            } => {
                let outcome = self.intake.resolve_taken(
                    &ride_id,
                    driver_id.as_deref(),
                    &self.agent.driver_id,
                    self.lifecycle.current(),
                );
                match outcome {
                    RaceOutcome::Discard => {
                        let message = message.unwrap_or_else(|| "Ride accepted by another driver".to_string());
                        self.lose_race(&ride_id, message);
                    }
                    RaceOutcome::SelfEcho => tracing::debug!("Ignoring our own taken broadcast for ride {}", ride_id),
                    RaceOutcome::NotApplicable => {
                        tracing::debug!("Taken broadcast for ride {} does not affect the slot", ride_id)
                    }
                }
            }
            InboundEvent::RideAlreadyAccepted { ride_id } => {
                let outcome = self
                    .intake
                    .resolve_taken(&ride_id, None, &self.agent.driver_id, self.lifecycle.current());
                if outcome == RaceOutcome::Discard {
                    self.lose_race(&ride_id, "Ride already accepted".to_string());
                }
            }
            InboundEvent::RideOtp { ride_id, otp } => {
                if self.lifecycle.attach_otp(&ride_id, &otp) {
                    tracing::info!("OTP received for ride {}", ride_id);
                    self.persist_current().await;
                } else {
                    tracing::debug!("OTP for ride {} does not match the slot", ride_id);
                }
            }
            InboundEvent::UserLiveLocation { ride_id, location } => {
                if !self.lifecycle.set_passenger_location(ride_id.as_deref(), location) {
                    tracing::debug!("Ignoring passenger location for ride {:?}", ride_id);
                }
            }
            InboundEvent::UserDataForDriver {
                ride_id,
                user_id,
                location,
            } => {
                if let Some(user_id) = user_id {
                    self.lifecycle.set_passenger_id(ride_id.as_deref(), &user_id);
                }
                if let Some(location) = location {
                    self.lifecycle.set_passenger_location(ride_id.as_deref(), location);
                }
            }
            InboundEvent::RideStarted { ride_id } => {
                tracing::info!("Dispatch confirmed start of ride {}", ride_id);
            }
        }
    }

    fn lose_race(&mut self, ride_id: &str, message: String) {
        if self.lifecycle.discard(ride_id).is_some() {
            tracing::info!("Lost ride {}: {}", ride_id, message);
            self.notice = Some(Notice::RideTaken {
                ride_id: ride_id.to_string(),
                message,
            });
            self.fail_pending_accept(ride_id, AgentError::RideAlreadyTaken(ride_id.to_string()));
        }
    }

    // ---------------------------------------------------------------------
    // Offer intake
    // ---------------------------------------------------------------------

    async fn on_push(&mut self, message: PushMessage, now: DateTime<Utc>) {
        if !message.is_ride_request() {
            tracing::debug!("Ignoring non-ride push message");
            return;
        }
        let offer = match RideOffer::from_push_data(&message.data, message.received_at) {
            Ok(offer) => offer,
            Err(e) => {
                tracing::warn!("Dropping push offer: {}", e);
                return;
            }
        };

        if self.backgrounded {
            if let Err(e) = self.inbox.park_offer(&offer, now).await {
                tracing::warn!("Could not park push offer {}: {}", offer.ride_id, e);
            }
            return;
        }
        self.intake_offer(offer, now);
    }

    fn intake_offer(&mut self, offer: RideOffer, now: DateTime<Utc>) {
        if !self.agent.online || self.offline_pending {
            tracing::warn!("Dropping offer {}: driver not taking rides", offer.ride_id);
            return;
        }

        match self.intake.admit(&offer, self.lifecycle.current(), now) {
            Admission::Admit => {
                if let Err(e) = self.lifecycle.present(offer) {
                    tracing::warn!("Dropping offer: {}", e);
                }
            }
            rejected => tracing::warn!("Dropping offer {}: {}", offer.ride_id, rejected.reason()),
        }
    }

    fn apply_intent(&mut self, intent: ActionIntent) {
        let pending = self.lifecycle.current() == Some((intent.ride_id.as_str(), RideStatus::OnTheWay));
        if !pending {
            tracing::info!(
                "Ignoring notification {:?} for ride {}: not the pending offer",
                intent.action,
                intent.ride_id
            );
            return;
        }
        let result = match intent.action {
            RideAction::Accept => self.start_accept().map(|_| ()),
            RideAction::Reject => self.lifecycle.reject().map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!("Notification {:?} for ride {} failed: {}", intent.action, intent.ride_id, e);
        } else if intent.action == RideAction::Reject {
            self.spawn_emit(
                names::REJECT_RIDE,
                &RejectRidePayload {
                    ride_id: intent.ride_id,
                    driver_id: self.agent.driver_id.clone(),
                },
            );
        }
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    async fn on_command(&mut self, command: DriverCommand, now: DateTime<Utc>) {
        match command {
            DriverCommand::GoOnline(reply) => {
                let result = self.go_online(now).await;
                self.respond(reply, result);
            }
            DriverCommand::GoOffline(reply) => {
                let result = if self.lifecycle.status().owns_ride() {
                    Err(AgentError::invalid_status("no owned ride", self.lifecycle.status()))
                } else {
                    self.go_offline("driver request").await;
                    Ok(())
                };
                self.respond(reply, result);
            }
            DriverCommand::ExtendHours(reply) => {
                let result = self.extend_hours(now).await;
                self.respond(reply, result);
            }
            DriverCommand::Accept(reply) => match self.start_accept() {
                Ok(ride_id) => self.pending_accept = Some((ride_id, Some(reply))),
                Err(e) => {
                    tracing::warn!("Accept refused: {}", e);
                    self.respond(reply, Err(e));
                }
            },
            DriverCommand::Reject(reply) => {
                let result = self.lifecycle.reject().map(|offer| {
                    self.spawn_emit(
                        names::REJECT_RIDE,
                        &RejectRidePayload {
                            ride_id: offer.ride_id,
                            driver_id: self.agent.driver_id.clone(),
                        },
                    );
                });
                self.respond(reply, result);
            }
            DriverCommand::VerifyOtp(code, reply) => {
                let result = self.verify_otp(&code, now).await;
                self.respond(reply, result);
            }
            DriverCommand::Complete(reply) => {
                let result = self.complete(now).await;
                self.respond(reply, result);
            }
            DriverCommand::AcknowledgeSettlement(reply) => {
                let result = match self.lifecycle.acknowledge_settlement() {
                    Ok(settlement) => {
                        tracing::info!("Settlement for ride {} acknowledged", settlement.ride_id);
                        if let Err(e) = self.persistence.clear().await {
                            tracing::warn!("Could not clear ride state: {}", e);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                self.respond(reply, result);
            }
            DriverCommand::SetRiderDetailsVisible(visible, reply) => {
                let result = if self.lifecycle.set_rider_details_visible(visible) {
                    self.persist_current().await;
                    Ok(())
                } else {
                    Err(AgentError::NoActiveRide)
                };
                self.respond(reply, result);
            }
            DriverCommand::NotificationAction(action, ride_id, reply) => {
                let result = if self.backgrounded {
                    self.inbox.record_intent(action, &ride_id, now).await
                } else {
                    self.apply_intent(ActionIntent {
                        action,
                        ride_id,
                        timestamp: now,
                    });
                    Ok(())
                };
                self.respond(reply, result);
            }
            DriverCommand::EnterBackground(reply) => {
                self.enter_background().await;
                self.respond(reply, Ok(()));
            }
            DriverCommand::EnterForeground(reply) => {
                self.enter_foreground(now).await;
                self.respond(reply, Ok(()));
            }
            DriverCommand::Shutdown(reply) => {
                // Normally intercepted by the run loop.
                self.shutdown().await;
                self.respond(reply, Ok(()));
            }
        }
    }

    async fn go_online(&mut self, now: DateTime<Utc>) -> AgentResult<()> {
        if self.agent.online {
            return Ok(());
        }

        let receipt = tokio::time::timeout(HOURS_API_TIMEOUT, self.deps.hours_api.start(&self.agent.driver_id)).await??;
        let budget = receipt
            .remaining_seconds
            .filter(|s| *s > 0)
            .unwrap_or(self.config.working_hours_budget.as_secs());

        let mut state = OnlineState::started(
            &self.agent.driver_id,
            &self.agent.driver_name,
            self.intake.vehicle_type().map(str::to_string),
            now,
            budget,
        );
        state.wallet_deducted = true;
        self.timer = Some(WorkingHoursTimer::new(state, &self.config.warning_thresholds));
        self.agent.online = true;
        self.agent.online_seconds = 0;
        if !self.lifecycle.status().owns_ride() {
            self.agent.status = DriverStatus::Online;
        }
        self.offline_pending = false;
        self.save_online_state().await;
        self.restart_sampling();

        tracing::info!("Driver {} online for {}", self.agent.driver_id, format_hms(budget));
        if self.deps.channel.is_connected() {
            self.register_driver().await;
        } else {
            self.spawn_reconnect();
        }
        Ok(())
    }

    async fn go_offline(&mut self, reason: &str) {
        if !self.agent.online {
            return;
        }
        tracing::info!("Driver {} going offline: {}", self.agent.driver_id, reason);

        if let Some((ride_id, RideStatus::OnTheWay)) = self.lifecycle.current() {
            let ride_id = ride_id.to_string();
            self.lifecycle.discard(&ride_id);
            self.fail_pending_accept(&ride_id, AgentError::NotOnline);
        }
        if let Err(e) = self.inbox.discard_offer().await {
            tracing::warn!("Could not discard parked offer: {}", e);
        }
        match tokio::time::timeout(HOURS_API_TIMEOUT, self.deps.hours_api.stop(&self.agent.driver_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Working hours stop failed: {}", e),
            Err(_) => tracing::warn!("Working hours stop timed out"),
        }
        self.emit(names::DRIVER_OFFLINE, &serde_json::json!({ "driverId": self.agent.driver_id }))
            .await;

        self.agent.online = false;
        if !self.lifecycle.status().owns_ride() {
            self.agent.status = DriverStatus::Offline;
        }
        self.offline_pending = false;
        self.timer = None;
        self.background_task = None;
        self.save_online_state().await;
        self.restart_sampling();
        self.notice = Some(Notice::WentOffline {
            reason: reason.to_string(),
        });
    }

    async fn extend_hours(&mut self, now: DateTime<Utc>) -> AgentResult<u64> {
        if self.timer.is_none() {
            return Err(AgentError::NotOnline);
        }
        let hours = self.config.extension_hours;
        tokio::time::timeout(HOURS_API_TIMEOUT, self.deps.hours_api.extend(&self.agent.driver_id, hours)).await??;

        let Some(timer) = self.timer.as_mut() else {
            return Err(AgentError::NotOnline);
        };
        timer.extend(Duration::from_secs(u64::from(hours) * 3600), now);
        let remaining = timer.remaining_seconds();
        if self.offline_pending {
            tracing::info!("Deferred offline cancelled by extension");
            self.offline_pending = false;
        }
        self.save_online_state().await;
        Ok(remaining)
    }

    /// Send the accept request in the background. The result comes back as
    /// [`AgentEvent::AcceptResolved`]; `pending_accept` holds the reply, if any.
    fn start_accept(&mut self) -> AgentResult<String> {
        let request = self
            .lifecycle
            .begin_accept(&self.agent.driver_id, &self.agent.driver_name)?;
        let ride_id = request.ride_id.clone();
        self.pending_accept = Some((ride_id.clone(), None));

        let channel = self.deps.channel.clone();
        let tx = self.events_tx.clone();
        let resolved_id = ride_id.clone();
        tokio::spawn(async move {
            let result = channel.accept_ride(&request).await;
            let _ = tx
                .send(AgentEvent::AcceptResolved {
                    ride_id: resolved_id,
                    result,
                })
                .await;
        });
        Ok(ride_id)
    }

    fn fail_pending_accept(&mut self, ride_id: &str, error: AgentError) {
        if self.pending_accept.as_ref().is_some_and(|(id, _)| id == ride_id) {
            if let Some((_, Some(reply))) = self.pending_accept.take() {
                self.respond(reply, Err(error));
            }
        }
    }

    async fn on_accept_resolved(&mut self, ride_id: String, result: AgentResult<AcceptResponse>, now: DateTime<Utc>) {
        let reply = match self.pending_accept.take() {
            Some((id, reply)) if id == ride_id => reply,
            other => {
                self.pending_accept = other;
                None
            }
        };

        let outcome = self.lifecycle.finish_accept(&ride_id, result);
        let response = match outcome {
            AcceptOutcome::Accepted => {
                self.agent.status = DriverStatus::OnRide;
                self.announce_accept(&ride_id).await;
                self.persist_current().await;
                self.request_route(RouteLeg::Pickup, now);
                Ok(RideStatus::Accepted)
            }
            AcceptOutcome::Failed(e) => {
                self.notice = Some(Notice::AcceptFailed {
                    ride_id: ride_id.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
            AcceptOutcome::Lost { ride_id, message } => {
                let message = message.unwrap_or_else(|| "Ride accepted by another driver".to_string());
                self.notice = Some(Notice::RideTaken {
                    ride_id: ride_id.clone(),
                    message,
                });
                Err(AgentError::RideAlreadyTaken(ride_id))
            }
            AcceptOutcome::Stale => Err(AgentError::RideNotCurrent(ride_id)),
        };

        if let Some(reply) = reply {
            self.respond(reply, response);
        }
    }

    async fn announce_accept(&self, ride_id: &str) {
        let user_id = self.lifecycle.ride().and_then(|r| r.passenger.user_id.clone());
        self.emit(
            names::RIDE_TAKEN_BY_DRIVER,
            &RideTakenPayload {
                ride_id: ride_id.to_string(),
                driver_id: self.agent.driver_id.clone(),
                driver_name: self.agent.driver_name.clone(),
            },
        )
        .await;
        self.emit(
            names::DRIVER_ACCEPTED_RIDE,
            &DriverAcceptedPayload {
                ride_id: ride_id.to_string(),
                driver_id: self.agent.driver_id.clone(),
                user_id,
                driver_location: self.position(),
            },
        )
        .await;
        self.emit(
            names::GET_USER_DATA_FOR_DRIVER,
            &serde_json::json!({ "rideId": ride_id, "driverId": self.agent.driver_id }),
        )
        .await;
    }

    async fn verify_otp(&mut self, code: &str, now: DateTime<Utc>) -> AgentResult<()> {
        let position = self.require_position().await?;
        self.lifecycle.verify_otp(code, position)?;

        let (ride_id, user_id) = match self.lifecycle.ride() {
            Some(ride) => (ride.ride_id().to_string(), ride.passenger.user_id.clone()),
            None => return Err(AgentError::NoActiveRide),
        };
        let verified = OtpVerifiedPayload {
            ride_id: ride_id.clone(),
            driver_id: self.agent.driver_id.clone(),
            user_id,
            timestamp: now,
            driver_location: position,
        };
        self.emit(names::OTP_VERIFIED, &verified).await;
        self.emit(names::DRIVER_STARTED_RIDE, &verified).await;
        self.emit(
            names::RIDE_STATUS_UPDATE,
            &RideStatusUpdatePayload {
                ride_id,
                status: RideStatus::Started.as_str().to_string(),
                otp_verified: Some(true),
                timestamp: now,
            },
        )
        .await;

        self.persist_current().await;
        self.route_gate.reset();
        self.request_route(RouteLeg::Drop, now);
        Ok(())
    }

    async fn complete(&mut self, now: DateTime<Utc>) -> AgentResult<Settlement> {
        if self.lifecycle.status() == RideStatus::Completed {
            return self
                .lifecycle
                .ride()
                .and_then(|r| r.settlement.clone())
                .ok_or(AgentError::NoActiveRide);
        }
        let position = self.require_position().await?;
        let settlement = self.lifecycle.complete(position, &self.tariff, now)?;
        let user_id = self.lifecycle.ride().and_then(|r| r.passenger.user_id.clone());

        // Persist the completed record and queue delivery before anything else.
        self.persist_current().await;
        let payload = RideCompletedPayload {
            ride_id: settlement.ride_id.clone(),
            driver_id: self.agent.driver_id.clone(),
            user_id,
            distance: settlement.distance_km,
            fare: settlement.fare,
            actual_pickup: settlement.actual_pickup,
            actual_drop: settlement.actual_drop,
            timestamp: now,
        };
        match self.deps.outbox.enqueue(payload, now).await {
            Ok(_) => self.flush_outbox_now(),
            Err(e) => tracing::error!("Could not queue completion for ride {}: {}", settlement.ride_id, e),
        }

        self.emit(
            names::RIDE_STATUS_UPDATE,
            &RideStatusUpdatePayload {
                ride_id: settlement.ride_id.clone(),
                status: RideStatus::Completed.as_str().to_string(),
                otp_verified: None,
                timestamp: now,
            },
        )
        .await;

        self.ride_ended(false).await;
        Ok(settlement)
    }

    fn flush_outbox_now(&self) {
        let outbox = self.deps.outbox.clone();
        tokio::spawn(async move {
            match outbox.flush(Utc::now()).await {
                Ok(report) if !report.delivered.is_empty() => {
                    tracing::info!("Delivered {} queued completions", report.delivered.len());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Completion outbox flush failed: {}", e),
            }
        });
    }

    /// The owned ride left the slot (or reached `completed`).
    async fn ride_ended(&mut self, clear_record: bool) {
        self.route_task = None;
        self.route_gate.reset();
        self.agent.status = if self.agent.online {
            DriverStatus::Online
        } else {
            DriverStatus::Offline
        };
        if clear_record {
            if let Err(e) = self.persistence.clear().await {
                tracing::warn!("Could not clear ride state: {}", e);
            }
        }
        if self.offline_pending {
            self.go_offline("working hours expired").await;
        }
    }

    async fn enter_background(&mut self) {
        if self.backgrounded {
            return;
        }
        tracing::info!("Agent entering background");
        self.backgrounded = true;
        self.persist_current().await;
        self.save_online_state().await;

        if self.agent.online {
            let channel = self
                .deps
                .channel
                .with_policy(ReconnectPolicy::background(&self.config));
            let emitter = BackgroundEmitter::new(
                self.deps.sampler.clone(),
                channel,
                self.deps.store.clone(),
                self.config.background_emit_interval,
            );
            self.background_task = Some(emitter.spawn());
        }
    }

    async fn enter_foreground(&mut self, now: DateTime<Utc>) {
        if !self.backgrounded {
            return;
        }
        tracing::info!("Agent returning to foreground");
        self.backgrounded = false;
        self.background_task = None;
        self.spawn_reconnect();
        self.resume_parked_work(now).await;
        self.on_tick(now).await;
    }

    // ---------------------------------------------------------------------
    // Location and routes
    // ---------------------------------------------------------------------

    async fn on_sample(&mut self, sample: LocationSample, now: DateTime<Utc>) {
        let position = sample.coordinate();
        self.last_sample = Some(sample.clone());
        self.lifecycle.record_position(position);

        if let Some(leg) = RouteLeg::for_status(self.lifecycle.status()) {
            let needs_route = self.lifecycle.ride().is_some_and(|r| r.route.is_empty());
            match self.lifecycle.track_progress(position) {
                Some(deviation) if self.route_gate.should_refetch(now, deviation) => {
                    tracing::info!("Off route by {:.0} m, fetching a new route", deviation);
                    self.request_route(leg, now);
                }
                None if needs_route && self.route_gate.debounce_elapsed(now) => self.request_route(leg, now),
                _ => {}
            }
        }

        if !self.emit_throttle.ready(now) {
            return;
        }
        if self.lifecycle.status().owns_ride() {
            self.persist_current().await;
        }
        if self.agent.online && !self.backgrounded {
            let payload = LocationUpdatePayload {
                driver_id: self.agent.driver_id.clone(),
                driver_name: self.agent.driver_name.clone(),
                latitude: sample.latitude,
                longitude: sample.longitude,
                speed: sample.speed,
                bearing: sample.bearing,
                accuracy: sample.accuracy,
                timestamp: sample.timestamp,
                is_background: false,
                is_online: true,
                status: self.agent.status.as_str().to_string(),
                vehicle_type: self.intake.vehicle_type().map(str::to_string),
            };
            self.emit(names::DRIVER_LOCATION_UPDATE, &payload).await;
        }
    }

    fn request_route(&mut self, leg: RouteLeg, now: DateTime<Utc>) {
        let Some(origin) = self.position() else {
            tracing::debug!("No position yet, deferring route fetch");
            return;
        };
        let Some(ride) = self.lifecycle.ride() else {
            return;
        };
        let destination = match leg {
            RouteLeg::Pickup => ride.offer.pickup.coordinate(),
            RouteLeg::Drop => ride.offer.drop.coordinate(),
        };
        let ride_id = ride.ride_id().to_string();

        self.route_gate.mark_fetched(now);
        let planner = self.deps.routes.clone();
        let tx = self.events_tx.clone();
        // Replacing the guard aborts a fetch still in flight.
        self.route_task = Some(TaskGuard::spawn("route-fetch", async move {
            let route = planner.route(origin, destination).await;
            let _ = tx.send(AgentEvent::RouteFetched { ride_id, leg, route }).await;
        }));
    }

    fn on_route_fetched(&mut self, ride_id: String, leg: RouteLeg, route: AgentResult<RouteCoords>) {
        match route {
            Ok(route) => {
                let points = route.len();
                if self.lifecycle.set_route(&ride_id, leg, route) {
                    tracing::debug!("Route for ride {} ({:?}) has {} points", ride_id, leg, points);
                } else {
                    tracing::debug!("Discarding route for ride {}: no longer current", ride_id);
                }
            }
            Err(e) => tracing::warn!("Route fetch for ride {} failed: {}", ride_id, e),
        }
    }

    fn restart_sampling(&mut self) {
        let active = self.agent.online || self.lifecycle.status().owns_ride();
        let options = SamplerOptions {
            interval: if active {
                self.config.foreground_sample_interval
            } else {
                self.config.offline_sample_interval
            },
            high_accuracy: active,
        };
        self.sampling_task = Some(spawn_sampling(
            self.deps.sampler.clone(),
            options,
            self.events_tx.clone(),
            AgentEvent::Sample,
        ));
    }

    fn position(&self) -> Option<Coordinate> {
        self.last_sample.as_ref().map(LocationSample::coordinate)
    }

    async fn require_position(&mut self) -> AgentResult<Coordinate> {
        if let Some(position) = self.position() {
            return Ok(position);
        }
        let sample = self.deps.sampler.current().await?;
        let position = sample.coordinate();
        self.last_sample = Some(sample);
        Ok(position)
    }

    // ---------------------------------------------------------------------
    // Working-hours timer
    // ---------------------------------------------------------------------

    async fn on_tick(&mut self, now: DateTime<Utc>) {
        let Some(timer) = self.timer.as_mut() else {
            return;
        };
        let event = timer.tick(now);
        let state = timer.state();
        self.agent.online_seconds = state.working_hours_duration.saturating_sub(state.remaining_seconds);

        match event {
            Some(TimerEvent::Warning {
                level,
                remaining_seconds,
            }) => {
                tracing::info!("Working hours warning {}: {} left", level, format_hms(remaining_seconds));
                self.notice = Some(Notice::WorkingHoursWarning {
                    level,
                    remaining: format_hms(remaining_seconds),
                });
                self.save_online_state().await;
            }
            Some(TimerEvent::Expired) => self.on_hours_expired().await,
            None => {}
        }
    }

    async fn on_hours_expired(&mut self) {
        let owned = self
            .lifecycle
            .ride()
            .filter(|r| r.status.owns_ride())
            .map(|r| (r.ride_id().to_string(), r.passenger.user_id.clone()));

        let Some((ride_id, user_id)) = owned else {
            self.go_offline("working hours expired").await;
            return;
        };

        match self.config.expiry_policy {
            ExpiryPolicy::Preempt => {
                tracing::warn!("Working hours expired, ending ride {}", ride_id);
                self.emit(
                    names::DRIVER_RIDE_CANCELLED,
                    &RideCancelledPayload {
                        ride_id: ride_id.clone(),
                        driver_id: self.agent.driver_id.clone(),
                        user_id,
                    },
                )
                .await;
                self.lifecycle.discard(&ride_id);
                self.offline_pending = true;
                self.ride_ended(true).await;
                self.notice = Some(Notice::WorkingHoursExpired {
                    deferred_until_ride_ends: false,
                });
            }
            ExpiryPolicy::WaitForCompletion => {
                tracing::warn!("Working hours expired, going offline after ride {}", ride_id);
                self.offline_pending = true;
                self.notice = Some(Notice::WorkingHoursExpired {
                    deferred_until_ride_ends: true,
                });
            }
        }
    }

    // ---------------------------------------------------------------------
    // Persistence and output
    // ---------------------------------------------------------------------

    async fn persist_ride(&self, ride: &ActiveRide) {
        if let Err(e) = self.persistence.save(ride, self.agent.status, Utc::now()).await {
            tracing::error!("Could not persist ride {}: {}", ride.ride_id(), e);
        }
    }

    /// Persist the slot when it holds an owned or completed ride.
    async fn persist_current(&self) {
        match self.lifecycle.ride() {
            Some(ride) if ride.status.owns_ride() || ride.status == RideStatus::Completed => {
                self.persist_ride(ride).await;
            }
            _ => {}
        }
    }

    async fn save_online_state(&self) {
        let result = match &self.timer {
            Some(timer) if self.agent.online => {
                self.deps
                    .store
                    .set_json(StoreKeys::DRIVER_ONLINE_STATE, timer.state())
                    .await
            }
            _ => self.deps.store.remove(StoreKeys::DRIVER_ONLINE_STATE).await,
        };
        if let Err(e) = result {
            tracing::error!("Could not persist online state: {}", e);
        }
    }

    /// Fail-fast emit. Dropped emits are logged, never queued.
    async fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        if let Err(e) = self.deps.channel.emit(event, payload).await {
            tracing::debug!("Emit {} not sent: {}", event, e);
        }
    }

    /// Emit from a spawned task when the caller cannot await.
    fn spawn_emit<T: Serialize>(&self, event: &'static str, payload: &T) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Could not encode {}: {}", event, e);
                return;
            }
        };
        let channel = self.deps.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.emit(event, &value).await {
                tracing::debug!("Emit {} not sent: {}", event, e);
            }
        });
    }

    /// Publish first so a caller woken by the reply reads the new snapshot.
    fn respond<T>(&mut self, reply: Reply<T>, result: AgentResult<T>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn publish(&mut self) {
        let mut snapshot = self.snapshot();
        let revision = &mut self.revision;
        self.status_tx.send_if_modified(|current| {
            snapshot.revision = current.revision;
            if *current == snapshot {
                return false;
            }
            *revision += 1;
            snapshot.revision = *revision;
            *current = snapshot;
            true
        });
    }

    fn snapshot(&self) -> StatusSnapshot {
        let ride = self.lifecycle.ride();
        StatusSnapshot {
            revision: self.revision,
            ride_status: self.lifecycle.status(),
            ride: ride.filter(|r| r.status != RideStatus::Completed).map(|r| self.ride_view(r)),
            settlement: ride.and_then(|r| r.settlement.clone()),
            agent: self.agent_view(),
            notice: self.notice.clone(),
            location: self.position(),
        }
    }

    fn ride_view(&self, ride: &ActiveRide) -> RideView {
        let remaining_route = match self.position() {
            Some(here) if !ride.route.is_empty() => ride.route.remaining_from(ride.progress.index, here),
            _ => ride.route.points().to_vec(),
        };
        RideView {
            ride_id: ride.ride_id().to_string(),
            status: ride.status,
            pickup: ride.offer.pickup.clone(),
            drop: ride.offer.drop.clone(),
            fare_estimate: ride.offer.fare,
            distance_estimate_km: ride.offer.distance_km,
            otp_received: ride.otp.is_some(),
            passenger: ride.passenger.clone(),
            passenger_location: ride.passenger_location,
            travelled_km: ride.distance.total_km(),
            remaining_route,
            rider_details_visible: ride.rider_details_visible,
        }
    }

    fn agent_view(&self) -> AgentView {
        let remaining = self.timer.as_ref().map(|t| t.remaining_seconds());
        AgentView {
            driver_id: self.agent.driver_id.clone(),
            driver_name: self.agent.driver_name.clone(),
            vehicle_type: self.intake.vehicle_type().map(str::to_string),
            driver_status: self.agent.status,
            online: self.agent.online,
            channel_connected: self.deps.channel.is_connected(),
            backgrounded: self.backgrounded,
            remaining_working_time: remaining.map(format_hms),
            remaining_seconds: remaining,
            warnings_issued: self.timer.as_ref().map(|t| t.state().warnings_issued).unwrap_or(0),
            offline_pending: self.offline_pending,
        }
    }

    fn empty_snapshot(agent: &AgentState) -> StatusSnapshot {
        StatusSnapshot {
            revision: 0,
            ride_status: RideStatus::Idle,
            ride: None,
            settlement: None,
            agent: AgentView {
                driver_id: agent.driver_id.clone(),
                driver_name: agent.driver_name.clone(),
                vehicle_type: agent.vehicle_type.clone(),
                driver_status: agent.status,
                online: agent.online,
                channel_connected: false,
                backgrounded: false,
                remaining_working_time: None,
                remaining_seconds: None,
                warnings_issued: 0,
                offline_pending: false,
            },
            notice: None,
            location: None,
        }
    }
}
