use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sparrow_driver::config::{AgentConfig, ExpiryPolicy};
use sparrow_driver::errors::{AgentError, AgentResult};
use sparrow_driver::models::agent::DriverStatus;
use sparrow_driver::models::events::names;
use sparrow_driver::models::location::{Coordinate, RouteCoords};
use sparrow_driver::models::ride::RideStatus;
use sparrow_driver::models::status::{Notice, StatusSnapshot};
use sparrow_driver::services::channel_service::MockChannelTransport;
use sparrow_driver::services::coordinator::CoordinatorHandle;
use sparrow_driver::services::notification_service::{MockNotificationService, RideAction};
use sparrow_driver::services::outbox_service::MockCompletionApi;
use sparrow_driver::services::route_service::{RoutePlanner, StraightLinePlanner};
use sparrow_driver::services::state_store::{MemoryStateStore, StateStore, StoreKeys};
use sparrow_driver::services::tracking_service::ScriptedSampler;
use sparrow_driver::services::working_hours_service::MockWorkingHoursApi;
use sparrow_driver::{AppState, PlatformServices};

const START: Coordinate = Coordinate {
    latitude: 0.0,
    longitude: 0.0,
};

fn test_config() -> AgentConfig {
    AgentConfig {
        driver_id: "drv-1".to_string(),
        driver_name: "Ravi".to_string(),
        vehicle_type: Some("taxi".to_string()),
        foreground_sample_interval: Duration::from_millis(20),
        offline_sample_interval: Duration::from_millis(20),
        location_emit_interval: Duration::from_millis(10),
        accept_timeout: Duration::from_millis(100),
        ack_timeout: Duration::from_millis(100),
        reconnect_attempts: 2,
        reconnect_base_delay: Duration::from_millis(1),
        reconnect_max_delay: Duration::from_millis(5),
        outbox_base_delay: Duration::from_millis(10),
        outbox_max_delay: Duration::from_millis(50),
        outbox_poll_interval: Duration::from_millis(30),
        ..AgentConfig::default()
    }
}

struct Harness {
    transport: Arc<MockChannelTransport>,
    sampler: Arc<ScriptedSampler>,
    push: Arc<MockNotificationService>,
    store: Arc<MemoryStateStore>,
    hours: Arc<MockWorkingHoursApi>,
    completions: Arc<MockCompletionApi>,
    app: AppState,
}

impl Harness {
    async fn start(config: AgentConfig) -> Self {
        Self::start_with(config, Arc::new(MemoryStateStore::new()), Arc::new(StraightLinePlanner)).await
    }

    async fn start_with(config: AgentConfig, store: Arc<MemoryStateStore>, routes: Arc<dyn RoutePlanner>) -> Self {
        let transport = Arc::new(MockChannelTransport::new());
        let sampler = Arc::new(ScriptedSampler::stationary(START));
        let push = Arc::new(MockNotificationService::new());
        let hours = Arc::new(MockWorkingHoursApi::new());
        let completions = Arc::new(MockCompletionApi::new());

        let platform = PlatformServices::new(transport.clone(), sampler.clone(), push.clone())
            .with_store(store.clone())
            .with_routes(routes)
            .with_hours_api(hours.clone())
            .with_completion_api(completions.clone());
        let app = AppState::new(config, platform).await.unwrap();

        let harness = Self {
            transport,
            sampler,
            push,
            store,
            hours,
            completions,
            app,
        };
        harness.wait("channel connected", |s| s.agent.channel_connected).await;
        harness
    }

    fn handle(&self) -> &CoordinatorHandle {
        &self.app.coordinator
    }

    async fn wait<F>(&self, what: &str, predicate: F) -> StatusSnapshot
    where
        F: FnMut(&StatusSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), self.handle().wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
            .unwrap()
    }

    async fn online(&self) {
        self.handle().go_online().await.unwrap();
        self.wait("online", |s| s.agent.online).await;
    }

    async fn offer(&self, ride_id: &str) {
        self.transport.inject(names::NEW_RIDE_REQUEST, offer_payload(ride_id));
        let id = ride_id.to_string();
        self.wait("offer presented", move |s| {
            s.ride.as_ref().is_some_and(|r| r.ride_id == id && r.status == RideStatus::OnTheWay)
        })
        .await;
    }

    async fn accepted(&self, ride_id: &str) {
        self.offer(ride_id).await;
        assert_eq!(self.handle().accept().await.unwrap(), RideStatus::Accepted);
    }

    async fn started(&self, ride_id: &str) {
        self.accepted(ride_id).await;
        self.transport
            .inject(names::RIDE_OTP, json!({ "rideId": ride_id, "otp": "4321" }));
        self.wait("otp received", |s| s.ride.as_ref().is_some_and(|r| r.otp_received))
            .await;
        self.handle().verify_otp("4321").await.unwrap();
    }

    async fn move_to(&self, at: Coordinate) {
        self.sampler.move_to(at);
        self.wait("position update", move |s| s.location == Some(at)).await;
    }

    async fn stored(&self, key: &str) -> Option<String> {
        self.store.get(key).await.unwrap()
    }
}

fn offer_payload(ride_id: &str) -> Value {
    json!({
        "rideId": ride_id,
        "pickup": { "lat": 0.0, "lng": 0.01, "address": "Gate 2" },
        "drop": { "lat": 0.0, "lng": 0.05, "address": "City Mall" },
        "fare": 60,
        "distance": 4,
        "vehicleType": "Taxi ",
        "userName": "Asha",
    })
}

fn push_offer(ride_id: &str) -> HashMap<String, String> {
    [
        ("type", "rideRequest"),
        ("rideId", ride_id),
        ("pickupLat", "0.0"),
        ("pickupLng", "0.01"),
        ("dropLat", "0.0"),
        ("dropLng", "0.05"),
        ("fare", "60"),
        ("distance", "4"),
        ("vehicleType", "taxi"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[tokio::test]
async fn full_ride_flow_settles_and_delivers_completion() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    assert!(!h.transport.emitted_named(names::REGISTER_DRIVER).is_empty());

    h.started("R1").await;
    assert_eq!(h.handle().snapshot().agent.driver_status, DriverStatus::OnRide);
    assert_eq!(h.transport.emitted_named(names::RIDE_TAKEN_BY_DRIVER).len(), 1);
    assert_eq!(h.transport.emitted_named(names::OTP_VERIFIED).len(), 1);

    // About 1.1 km east of the OTP location.
    h.move_to(Coordinate::new(0.0, 0.01)).await;
    let settlement = h.handle().complete().await.unwrap();
    assert!(settlement.distance_km > 1.0 && settlement.distance_km < 1.3, "{}", settlement.distance_km);
    assert_eq!(settlement.rate_per_km, 15.0);
    assert_eq!(settlement.fare, (settlement.distance_km * 15.0).round() as i64);

    // A second completion returns the same bill.
    assert_eq!(h.handle().complete().await.unwrap(), settlement);

    let snapshot = h.wait("settlement shown", |s| s.ride_status == RideStatus::Completed).await;
    assert_eq!(snapshot.settlement.as_ref(), Some(&settlement));
    assert_eq!(snapshot.agent.driver_status, DriverStatus::Online);

    tokio::time::timeout(Duration::from_secs(3), async {
        while !h.app.outbox.pending().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("completion never delivered");
    let sent = h.transport.emitted_named(names::DRIVER_COMPLETED_RIDE);
    assert_eq!(sent[0]["rideId"], "R1");
    assert_eq!(sent[0]["fare"], settlement.fare);

    h.handle().acknowledge_settlement().await.unwrap();
    h.wait("slot idle", |s| s.ride_status == RideStatus::Idle).await;
    assert_eq!(h.stored(StoreKeys::RIDE_STATE).await, None);
}

#[tokio::test]
async fn same_offer_on_both_paths_is_presented_once() {
    let h = Harness::start(test_config()).await;
    h.online().await;

    h.offer("R1").await;
    h.push.deliver(push_offer("R1"));
    h.handle().reject().await.unwrap();
    h.wait("offer rejected", |s| s.ride_status == RideStatus::Idle).await;

    // The push copy arrives late and is still inside the dedup window.
    h.push.deliver(push_offer("R1"));
    h.transport.inject(names::NEW_RIDE_REQUEST, offer_payload("R1"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Idle);

    h.push.deliver(push_offer("R2"));
    h.wait("second offer", |s| s.ride.as_ref().is_some_and(|r| r.ride_id == "R2"))
        .await;
    assert_eq!(h.transport.emitted_named(names::REJECT_RIDE).len(), 1);
}

#[tokio::test]
async fn offers_are_dropped_while_offline_or_for_other_vehicles() {
    let h = Harness::start(test_config()).await;
    h.transport.inject(names::NEW_RIDE_REQUEST, offer_payload("R1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Idle);

    h.online().await;
    let mut bike = offer_payload("R2");
    bike["vehicleType"] = json!("bike");
    h.transport.inject(names::NEW_RIDE_REQUEST, bike);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Idle);
}

#[tokio::test]
async fn lost_accept_acknowledgement_leaves_the_offer_pending() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.offer("R1").await;

    h.transport.delay_acks(Duration::from_millis(300));
    let err = h.handle().accept().await.unwrap_err();
    assert!(err.is_connectivity(), "{:?}", err);

    let snapshot = h.handle().snapshot();
    assert_eq!(snapshot.ride_status, RideStatus::OnTheWay);
    assert!(matches!(snapshot.notice, Some(Notice::AcceptFailed { .. })));
    assert!(h.transport.emitted_named(names::RIDE_TAKEN_BY_DRIVER).is_empty());

    h.transport.delay_acks(Duration::ZERO);
    assert_eq!(h.handle().accept().await.unwrap(), RideStatus::Accepted);
}

#[tokio::test]
async fn declined_accept_means_another_driver_won() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.offer("R1").await;

    h.transport.reply_with(
        names::ACCEPT_RIDE,
        Ok(json!({ "success": false, "message": "Ride already taken" })),
    );
    assert!(matches!(h.handle().accept().await, Err(AgentError::RideAlreadyTaken(id)) if id == "R1"));
    let snapshot = h.wait("slot cleared", |s| s.ride_status == RideStatus::Idle).await;
    assert!(matches!(snapshot.notice, Some(Notice::RideTaken { .. })));
}

#[tokio::test]
async fn taken_broadcast_from_ourselves_is_ignored() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.accepted("R1").await;

    h.transport
        .inject(names::RIDE_TAKEN_BY_DRIVER, json!({ "rideId": "R1", "driverId": " drv-1" }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Accepted);

    // Once owned, even another driver's claim does not touch the ride.
    h.transport
        .inject(names::RIDE_TAKEN_BY_DRIVER, json!({ "rideId": "R1", "driverId": "drv-9" }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Accepted);
}

#[tokio::test]
async fn taken_broadcast_from_another_driver_discards_the_offer() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.offer("R1").await;

    h.transport
        .inject(names::RIDE_TAKEN_BY_DRIVER, json!({ "rideId": "R1", "driverId": 42 }));
    let snapshot = h.wait("offer discarded", |s| s.ride_status == RideStatus::Idle).await;
    assert!(matches!(snapshot.notice, Some(Notice::RideTaken { ref ride_id, .. }) if ride_id == "R1"));
    assert!(h.handle().accept().await.is_err());
}

#[tokio::test]
async fn cancellation_clears_an_owned_ride() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.accepted("R1").await;
    assert!(h.stored(StoreKeys::RIDE_STATE).await.is_some());

    h.transport.inject(names::RIDE_CANCELLED, json!({ "rideId": "R1" }));
    let snapshot = h.wait("ride cancelled", |s| s.ride_status == RideStatus::Idle).await;
    assert_eq!(snapshot.agent.driver_status, DriverStatus::Online);
    assert_eq!(h.stored(StoreKeys::RIDE_STATE).await, None);
}

#[tokio::test]
async fn started_ride_survives_a_restart_but_completed_does_not() {
    let store = Arc::new(MemoryStateStore::new());

    let first = Harness::start_with(test_config(), store.clone(), Arc::new(StraightLinePlanner)).await;
    first.online().await;
    first.started("R1").await;
    first.handle().shutdown().await.unwrap();

    let second = Harness::start_with(test_config(), store.clone(), Arc::new(StraightLinePlanner)).await;
    let snapshot = second.handle().snapshot();
    assert_eq!(snapshot.ride_status, RideStatus::Started);
    assert_eq!(snapshot.agent.driver_status, DriverStatus::OnRide);
    assert!(snapshot.agent.online);

    second.move_to(Coordinate::new(0.0, 0.005)).await;
    second.handle().complete().await.unwrap();
    second.handle().shutdown().await.unwrap();

    let third = Harness::start_with(test_config(), store.clone(), Arc::new(StraightLinePlanner)).await;
    let snapshot = third.handle().snapshot();
    assert_eq!(snapshot.ride_status, RideStatus::Idle);
    assert!(snapshot.settlement.is_none());
    assert_eq!(third.stored(StoreKeys::RIDE_STATE).await, None);
}

#[tokio::test]
async fn completion_waits_in_the_outbox_until_a_path_is_back() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.started("R1").await;

    h.completions.set_failing(true);
    for _ in 0..50 {
        h.transport
            .reply_with(names::DRIVER_COMPLETED_RIDE, Ok(json!({ "success": false })));
    }
    h.handle().complete().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let pending = h.app.outbox.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].attempts >= 1);
    assert!(h.stored(StoreKeys::PENDING_RIDE_COMPLETION).await.is_some());

    h.completions.set_failing(false);
    tokio::time::timeout(Duration::from_secs(3), async {
        while h.completions.delivered().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("completion never delivered over http");
    assert_eq!(h.completions.delivered()[0].ride_id, "R1");
}

struct FixedRoute(RouteCoords);

#[async_trait]
impl RoutePlanner for FixedRoute {
    async fn route(&self, _origin: Coordinate, _destination: Coordinate) -> AgentResult<RouteCoords> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn route_progress_never_moves_backwards() {
    let points: Vec<Coordinate> = (0..=10).map(|i| Coordinate::new(0.0, i as f64 * 0.001)).collect();
    let config = AgentConfig {
        route_deviation_meters: 10_000.0,
        ..test_config()
    };
    let h = Harness::start_with(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(FixedRoute(RouteCoords::new(points))),
    )
    .await;
    h.online().await;
    h.accepted("R1").await;
    h.wait("route installed", |s| s.ride.as_ref().is_some_and(|r| r.remaining_route.len() == 12))
        .await;

    h.move_to(Coordinate::new(0.0, 0.005)).await;
    let ahead = h.handle().snapshot().ride.unwrap().remaining_route.len();
    assert_eq!(ahead, 7);

    h.move_to(Coordinate::new(0.0, 0.002)).await;
    let after = h.handle().snapshot().ride.unwrap().remaining_route.len();
    assert_eq!(after, ahead);
}

#[tokio::test]
async fn shutdown_persists_the_ride_and_stops_the_coordinator() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.started("R1").await;

    h.app.shutdown().await.unwrap();
    assert!(h.stored(StoreKeys::RIDE_STATE).await.is_some());
    assert!(h.stored(StoreKeys::DRIVER_ONLINE_STATE).await.is_some());
    assert!(matches!(h.handle().go_offline().await, Err(AgentError::CoordinatorStopped)));

    // A second shutdown is a no-op.
    h.app.shutdown().await.unwrap();
}

#[derive(Default)]
struct CountingPlanner(std::sync::atomic::AtomicUsize);

#[async_trait]
impl RoutePlanner for CountingPlanner {
    async fn route(&self, origin: Coordinate, destination: Coordinate) -> AgentResult<RouteCoords> {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        StraightLinePlanner.route(origin, destination).await
    }
}

#[tokio::test]
async fn driving_along_a_sparse_route_does_not_refetch() {
    let planner = Arc::new(CountingPlanner::default());
    let h = Harness::start_with(test_config(), Arc::new(MemoryStateStore::new()), planner.clone()).await;
    h.online().await;
    h.accepted("R1").await;
    h.wait("route installed", |s| s.ride.as_ref().is_some_and(|r| !r.remaining_route.is_empty()))
        .await;
    assert_eq!(planner.0.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Straight toward the pickup at (0, 0.01), past the refetch debounce.
    for step in 1..=6 {
        h.move_to(Coordinate::new(0.0, step as f64 * 0.0015)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(planner.0.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Leaving the line by about 220 m does trigger a new route.
    h.move_to(Coordinate::new(0.002, 0.009)).await;
    tokio::time::timeout(Duration::from_secs(3), async {
        while planner.0.load(std::sync::atomic::Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no refetch after leaving the route");
}

#[tokio::test]
async fn expiry_preempts_the_ride_when_configured() {
    let config = AgentConfig {
        working_hours_budget: Duration::from_secs(2),
        warning_thresholds: vec![],
        expiry_policy: ExpiryPolicy::Preempt,
        ..test_config()
    };
    let h = Harness::start(config).await;
    h.online().await;
    h.accepted("R1").await;

    let snapshot = h.wait("offline after expiry", |s| !s.agent.online).await;
    assert_eq!(snapshot.ride_status, RideStatus::Idle);
    assert_eq!(snapshot.agent.driver_status, DriverStatus::Offline);
    assert_eq!(h.transport.emitted_named(names::DRIVER_RIDE_CANCELLED).len(), 1);
    assert_eq!(h.transport.emitted_named(names::DRIVER_OFFLINE).len(), 1);
    assert!(h.hours.calls().iter().any(|c| c == "stop:drv-1"));
}

#[tokio::test]
async fn expiry_waits_for_the_ride_to_finish_by_default() {
    let config = AgentConfig {
        working_hours_budget: Duration::from_secs(2),
        warning_thresholds: vec![],
        ..test_config()
    };
    let h = Harness::start(config).await;
    h.online().await;
    h.started("R1").await;

    let snapshot = h.wait("offline deferred", |s| s.agent.offline_pending).await;
    assert!(snapshot.agent.online);
    assert_eq!(snapshot.ride_status, RideStatus::Started);
    assert!(matches!(
        snapshot.notice,
        Some(Notice::WorkingHoursExpired {
            deferred_until_ride_ends: true
        })
    ));

    h.handle().complete().await.unwrap();
    let snapshot = h.wait("offline after ride", |s| !s.agent.online).await;
    assert_eq!(snapshot.ride_status, RideStatus::Completed);
    assert!(h.transport.emitted_named(names::DRIVER_RIDE_CANCELLED).is_empty());
}

#[tokio::test]
async fn extension_cancels_a_deferred_offline() {
    let config = AgentConfig {
        working_hours_budget: Duration::from_secs(2),
        warning_thresholds: vec![],
        ..test_config()
    };
    let h = Harness::start(config).await;
    h.online().await;
    h.accepted("R1").await;
    h.wait("offline deferred", |s| s.agent.offline_pending).await;

    let remaining = h.handle().extend_hours().await.unwrap();
    assert!(remaining > 11 * 3600);
    let snapshot = h.handle().snapshot();
    assert!(!snapshot.agent.offline_pending);
    assert!(h.hours.calls().iter().any(|c| c == "extend:drv-1:12"));
}

#[tokio::test]
async fn going_offline_is_refused_with_an_owned_ride() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.accepted("R1").await;
    assert!(matches!(
        h.handle().go_offline().await,
        Err(AgentError::InvalidRideStatus { .. })
    ));
}

#[tokio::test]
async fn backgrounded_push_offer_is_parked_until_foreground() {
    let h = Harness::start(test_config()).await;
    h.online().await;
    h.handle().enter_background().await.unwrap();

    h.push.deliver(push_offer("R5"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.handle().snapshot().ride_status, RideStatus::Idle);
    assert!(h.stored(StoreKeys::PENDING_RIDE_REQUEST).await.is_some());

    h.handle()
        .notification_action(RideAction::Accept, "R5")
        .await
        .unwrap();
    h.handle().enter_foreground().await.unwrap();

    h.wait("parked offer accepted", |s| s.ride_status == RideStatus::Accepted)
        .await;
    assert_eq!(h.stored(StoreKeys::PENDING_RIDE_REQUEST).await, None);
    assert_eq!(h.stored(StoreKeys::RIDE_ACTION_INTENT).await, None);
}
