// src/services/tracking_service.rs
//! Location and route tracking.
//!
//! The pure pieces (distance accumulation, route progress, refetch gating and
//! emit throttling) are owned by the coordinator and mutated only on its task.
//! The sampling loop and the background emitter are spawned tasks held by
//! [`TaskGuard`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::{AgentError, AgentResult};
use crate::models::agent::DriverStatus;
use crate::models::events::{LocationUpdatePayload, names};
use crate::models::location::{Coordinate, LocationSample, RouteCoords};
use crate::models::ride::RideStatus;
use crate::services::channel_service::DispatchChannel;
use crate::services::state_store::{StateStoreService, StoreKeys};
use crate::services::working_hours_service::OnlineState;
use crate::utils::geo::{distance_to_polyline_m, haversine_km, nearest_index};
use crate::utils::tasks::TaskGuard;

/// Distance travelled since the last reset, summed over consecutive samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceAccumulator {
    pub travelled_km: f64,
    pub last_coord: Option<Coordinate>,
}

impl DistanceAccumulator {
    /// Start counting from `origin`.
    pub fn reset_at(&mut self, origin: Coordinate) {
        self.travelled_km = 0.0;
        self.last_coord = Some(origin);
    }

    /// Add the leg from the previous sample. Returns the increment in km.
    pub fn record(&mut self, position: Coordinate) -> f64 {
        if !position.is_valid() {
            return 0.0;
        }
        let delta = self.last_coord.map(|last| haversine_km(last, position)).unwrap_or(0.0);
        self.travelled_km += delta;
        self.last_coord = Some(position);
        delta
    }

    pub fn total_km(&self) -> f64 {
        self.travelled_km
    }
}

/// Which leg of the ride a route polyline covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteLeg {
    Pickup, // current position -> pickup
    Drop,   // current position -> drop
}

impl RouteLeg {
    pub fn for_status(status: RideStatus) -> Option<RouteLeg> {
        match status {
            RideStatus::Accepted => Some(RouteLeg::Pickup),
            RideStatus::Started => Some(RouteLeg::Drop),
            _ => None,
        }
    }
}

/// Position along the current route. The index only moves forward until a
/// new route replaces the segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteProgress {
    pub index: usize,
    pub leg: Option<RouteLeg>,
}

impl RouteProgress {
    pub fn restart(&mut self, leg: RouteLeg) {
        self.index = 0;
        self.leg = Some(leg);
    }

    /// Snap `position` onto the route, searching only ahead of the current index.
    /// Returns the (possibly unchanged) slice index and the distance in metres
    /// from `position` to the polyline still ahead.
    pub fn advance(&mut self, position: Coordinate, route: &RouteCoords) -> Option<(usize, f64)> {
        let points = route.points();
        if points.is_empty() {
            return None;
        }
        let start = self.index.min(points.len() - 1);
        let (offset, _) = nearest_index(position, &points[start..])?;
        self.index = self.index.max(start + offset);
        // The segment leading into the current vertex is still ahead of a driver who has not reached it.
        let deviation = distance_to_polyline_m(position, &points[start.saturating_sub(1)..])?;
        Some((self.index, deviation))
    }
}

/// Decides when the route should be fetched again.
#[derive(Debug, Clone)]
pub struct RouteRefreshGate {
    debounce: Duration,
    deviation_meters: f64,
    last_fetch: Option<DateTime<Utc>>,
}

impl RouteRefreshGate {
    pub fn new(debounce: Duration, deviation_meters: f64) -> Self {
        Self {
            debounce: debounce.max(Duration::from_secs(2)),
            deviation_meters,
            last_fetch: None,
        }
    }

    /// A fetch is due when the position strays beyond the threshold and the debounce has elapsed.
    pub fn should_refetch(&self, now: DateTime<Utc>, deviation_meters: f64) -> bool {
        deviation_meters > self.deviation_meters && self.debounce_elapsed(now)
    }

    pub fn debounce_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_fetch {
            Some(last) => elapsed_since(last, now) >= self.debounce,
            None => true,
        }
    }

    pub fn mark_fetched(&mut self, now: DateTime<Utc>) {
        self.last_fetch = Some(now);
    }

    pub fn reset(&mut self) {
        self.last_fetch = None;
    }
}

/// Limits foreground location emits to one per interval.
#[derive(Debug, Clone)]
pub struct EmitThrottle {
    interval: Duration,
    last: Option<DateTime<Utc>>,
}

impl EmitThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn ready(&mut self, now: DateTime<Utc>) -> bool {
        let due = self.last.is_none_or(|last| elapsed_since(last, now) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }
}

fn elapsed_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerOptions {
    pub interval: Duration,
    pub high_accuracy: bool,
}

/// Platform geolocation. The stream ends when the platform stops delivering.
#[async_trait]
pub trait LocationSampler: Send + Sync {
    fn subscribe(&self, options: SamplerOptions) -> BoxStream<'static, LocationSample>;
    async fn current(&self) -> AgentResult<LocationSample>;
}

/// Replays a fixed path, then holds the last point. Used in tests and demo runs.
pub struct ScriptedSampler {
    path: Arc<Vec<Coordinate>>,
    position: Arc<Mutex<Option<Coordinate>>>,
}

impl ScriptedSampler {
    pub fn new(path: Vec<Coordinate>) -> Self {
        Self {
            position: Arc::new(Mutex::new(path.first().copied())),
            path: Arc::new(path),
        }
    }

    pub fn stationary(at: Coordinate) -> Self {
        Self::new(vec![at])
    }

    /// Jump to a position; the next emitted and current sample use it.
    pub fn move_to(&self, at: Coordinate) {
        if let Ok(mut position) = self.position.lock() {
            *position = Some(at);
        }
    }
}

#[async_trait]
impl LocationSampler for ScriptedSampler {
    fn subscribe(&self, options: SamplerOptions) -> BoxStream<'static, LocationSample> {
        let path = self.path.clone();
        let position = self.position.clone();
        stream::unfold(0usize, move |step| {
            let path = path.clone();
            let position = position.clone();
            async move {
                if step > 0 {
                    tokio::time::sleep(options.interval).await;
                }
                let next = match path.get(step) {
                    Some(point) => {
                        if let Ok(mut p) = position.lock() {
                            *p = Some(*point);
                        }
                        Some(*point)
                    }
                    None => position.lock().ok().and_then(|p| *p),
                };
                next.map(|point| (LocationSample::at(point, Utc::now()), step + 1))
            }
        })
        .boxed()
    }

    async fn current(&self) -> AgentResult<LocationSample> {
        let position = self.position.lock().ok().and_then(|p| *p);
        position
            .map(|point| LocationSample::at(point, Utc::now()))
            .ok_or(AgentError::NoLocation)
    }
}

/// Forward sampler output into the coordinator's queue until either side closes.
pub fn spawn_sampling<E, F>(
    sampler: Arc<dyn LocationSampler>,
    options: SamplerOptions,
    events: mpsc::Sender<E>,
    wrap: F,
) -> TaskGuard
where
    E: Send + 'static,
    F: Fn(LocationSample) -> E + Send + 'static,
{
    TaskGuard::spawn("location-sampling", async move {
        let mut samples = sampler.subscribe(options);
        while let Some(sample) = samples.next().await {
            if !sample.coordinate().is_valid() {
                tracing::debug!("Skipping invalid location sample");
                continue;
            }
            if events.send(wrap(sample)).await.is_err() {
                break;
            }
        }
        tracing::debug!("Location sampling stopped");
    })
}

/// Reduced-rate location emitter for when the agent is suspended.
///
/// Reads everything it needs from the state store so it can keep running
/// without the coordinator.
pub struct BackgroundEmitter {
    sampler: Arc<dyn LocationSampler>,
    channel: DispatchChannel,
    store: StateStoreService,
    interval: Duration,
}

impl BackgroundEmitter {
    pub fn new(
        sampler: Arc<dyn LocationSampler>,
        channel: DispatchChannel,
        store: StateStoreService,
        interval: Duration,
    ) -> Self {
        Self { sampler, channel, store, interval }
    }

    pub fn spawn(self) -> TaskGuard {
        TaskGuard::spawn("background-location", async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.emit_once().await {
                    tracing::warn!("Background location update failed: {}", e);
                }
            }
        })
    }

    /// One background emit. Returns `false` when the persisted state says offline.
    pub async fn emit_once(&self) -> AgentResult<bool> {
        let online: Option<OnlineState> = self.store.get_json(StoreKeys::DRIVER_ONLINE_STATE).await?;
        let Some(online) = online.filter(|s| s.is_online) else {
            return Ok(false);
        };

        let ride_status: Option<RideStatus> = self.store.get_json(StoreKeys::CURRENT_RIDE_STATUS).await?;
        let status = match ride_status {
            Some(status) if status.owns_ride() => DriverStatus::OnRide,
            _ => DriverStatus::Online,
        };

        let sample = self.sampler.current().await?;
        self.channel.ensure_connected().await?;

        let payload = LocationUpdatePayload {
            driver_id: online.driver_id.clone(),
            driver_name: online.driver_name.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            speed: sample.speed,
            bearing: sample.bearing,
            accuracy: sample.accuracy,
            timestamp: sample.timestamp,
            is_background: true,
            is_online: true,
            status: status.as_str().to_string(),
            vehicle_type: online.vehicle_type.clone(),
        };
        self.channel.emit(names::DRIVER_LOCATION_UPDATE, &payload).await?;
        tracing::debug!("Background location sent for driver: {}", online.driver_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::services::channel_service::MockChannelTransport;
    use crate::services::state_store::MemoryStateStore;
    use chrono::Duration as ChronoDuration;

    fn line(n: usize) -> RouteCoords {
        RouteCoords::new((0..n).map(|i| Coordinate::new(0.0, i as f64 * 0.001)).collect())
    }

    #[test]
    fn accumulator_sums_consecutive_legs() {
        let mut acc = DistanceAccumulator::default();
        acc.reset_at(Coordinate::new(0.0, 0.0));
        acc.record(Coordinate::new(0.0, 0.01));
        acc.record(Coordinate::new(0.0, 0.02));
        assert!((acc.total_km() - 2.22).abs() < 0.01, "got {}", acc.total_km());

        acc.reset_at(Coordinate::new(0.0, 0.02));
        assert_eq!(acc.total_km(), 0.0);
    }

    #[test]
    fn accumulator_ignores_invalid_points() {
        let mut acc = DistanceAccumulator::default();
        acc.reset_at(Coordinate::new(0.0, 0.0));
        assert_eq!(acc.record(Coordinate::new(f64::NAN, 0.0)), 0.0);
        assert_eq!(acc.last_coord, Some(Coordinate::new(0.0, 0.0)));
    }

    #[test]
    fn route_index_never_moves_backwards() {
        let route = line(10);
        let mut progress = RouteProgress::default();
        progress.restart(RouteLeg::Pickup);

        progress.advance(Coordinate::new(0.0, 0.005), &route);
        assert_eq!(progress.index, 5);

        // A noisy fix near an earlier point does not rewind progress.
        progress.advance(Coordinate::new(0.0, 0.001), &route);
        assert_eq!(progress.index, 5);

        progress.advance(Coordinate::new(0.0, 0.008), &route);
        assert_eq!(progress.index, 8);

        progress.restart(RouteLeg::Drop);
        assert_eq!(progress.index, 0);
    }

    #[test]
    fn on_route_samples_between_sparse_points_do_not_deviate() {
        let route = RouteCoords::straight_line(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 0.05));
        let mut progress = RouteProgress::default();
        progress.restart(RouteLeg::Drop);
        let gate = RouteRefreshGate::new(Duration::from_secs(2), 50.0);
        let now = Utc::now();

        for lng in [0.01, 0.02, 0.03, 0.04] {
            let (_, deviation) = progress.advance(Coordinate::new(0.0, lng), &route).unwrap();
            assert!(deviation < 1.0, "deviation {} at lng {}", deviation, lng);
            assert!(!gate.should_refetch(now, deviation));
        }

        // 0.001 degrees of latitude off the line is about 111 m.
        let (_, deviation) = progress.advance(Coordinate::new(0.001, 0.045), &route).unwrap();
        assert!(gate.should_refetch(now, deviation), "deviation {}", deviation);
    }

    #[test]
    fn refetch_requires_deviation_and_debounce() {
        let now = Utc::now();
        let mut gate = RouteRefreshGate::new(Duration::from_secs(2), 50.0);
        assert!(!gate.should_refetch(now, 10.0));
        assert!(gate.should_refetch(now, 80.0));

        gate.mark_fetched(now);
        assert!(!gate.should_refetch(now + ChronoDuration::milliseconds(1500), 80.0));
        assert!(gate.should_refetch(now + ChronoDuration::seconds(2), 80.0));
    }

    #[test]
    fn debounce_has_a_two_second_floor() {
        let now = Utc::now();
        let mut gate = RouteRefreshGate::new(Duration::from_millis(100), 50.0);
        gate.mark_fetched(now);
        assert!(!gate.debounce_elapsed(now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn throttle_allows_one_emit_per_interval() {
        let now = Utc::now();
        let mut throttle = EmitThrottle::new(Duration::from_secs(3));
        assert!(throttle.ready(now));
        assert!(!throttle.ready(now + ChronoDuration::seconds(1)));
        assert!(throttle.ready(now + ChronoDuration::seconds(3)));
    }

    #[tokio::test]
    async fn scripted_sampler_replays_then_holds() {
        let sampler = ScriptedSampler::new(vec![Coordinate::new(1.0, 1.0), Coordinate::new(2.0, 2.0)]);
        let options = SamplerOptions { interval: Duration::from_millis(1), high_accuracy: true };
        let samples: Vec<_> = sampler.subscribe(options).take(3).collect().await;
        assert_eq!(samples[0].coordinate(), Coordinate::new(1.0, 1.0));
        assert_eq!(samples[1].coordinate(), Coordinate::new(2.0, 2.0));
        assert_eq!(samples[2].coordinate(), Coordinate::new(2.0, 2.0));
        assert_eq!(sampler.current().await.unwrap().coordinate(), Coordinate::new(2.0, 2.0));
    }

    #[tokio::test]
    async fn background_emitter_reads_state_from_the_store() {
        let store = StateStoreService::new(Arc::new(MemoryStateStore::new()));
        let transport = Arc::new(MockChannelTransport::connected());
        let channel = DispatchChannel::new(transport.clone(), &AgentConfig::default());
        let sampler: Arc<dyn LocationSampler> = Arc::new(ScriptedSampler::stationary(Coordinate::new(17.4, 78.4)));
        let emitter = BackgroundEmitter::new(sampler, channel, store.clone(), Duration::from_secs(10));

        // Nothing persisted: treated as offline.
        assert!(!emitter.emit_once().await.unwrap());

        let mut online = OnlineState::started("drv-1", "Ravi", Some("taxi".to_string()), Utc::now(), 3600);
        online.is_online = true;
        store.set_json(StoreKeys::DRIVER_ONLINE_STATE, &online).await.unwrap();
        store.set_json(StoreKeys::CURRENT_RIDE_STATUS, &RideStatus::Started).await.unwrap();

        assert!(emitter.emit_once().await.unwrap());
        let sent = transport.emitted_named(names::DRIVER_LOCATION_UPDATE);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["isBackground"], true);
        assert_eq!(sent[0]["status"], "onRide");
        assert_eq!(sent[0]["vehicleType"], "taxi");
    }
}
