// src/state.rs
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::services::channel_service::{ChannelTransport, DispatchChannel};
use crate::services::coordinator::{CoordinatorDeps, CoordinatorHandle, RideCoordinator};
use crate::services::notification_service::NotificationService;
use crate::services::outbox_service::{CompletionApi, CompletionOutbox, HttpCompletionApi};
use crate::services::route_service::{OsrmRoutePlanner, RoutePlanner, StraightLinePlanner};
use crate::services::state_store::{MemoryStateStore, RedisStateStore, StateStore, StateStoreService};
use crate::services::tracking_service::LocationSampler;
use crate::services::working_hours_service::{HttpWorkingHoursApi, WorkingHoursApi};

/// Services the host platform provides. The optional ones fall back to
/// configuration-driven defaults when left empty.
pub struct PlatformServices {
    pub transport: Arc<dyn ChannelTransport>,
    pub sampler: Arc<dyn LocationSampler>,
    pub notifications: Arc<dyn NotificationService>,
    pub store: Option<Arc<dyn StateStore>>,
    pub routes: Option<Arc<dyn RoutePlanner>>,
    pub hours_api: Option<Arc<dyn WorkingHoursApi>>,
    pub completion_api: Option<Arc<dyn CompletionApi>>,
}

impl PlatformServices {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        sampler: Arc<dyn LocationSampler>,
        notifications: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            transport,
            sampler,
            notifications,
            store: None,
            routes: None,
            hours_api: None,
            completion_api: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_routes(mut self, routes: Arc<dyn RoutePlanner>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn with_hours_api(mut self, api: Arc<dyn WorkingHoursApi>) -> Self {
        self.hours_api = Some(api);
        self
    }

    pub fn with_completion_api(mut self, api: Arc<dyn CompletionApi>) -> Self {
        self.completion_api = Some(api);
        self
    }
}

pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub outbox: Arc<CompletionOutbox>,
    coordinator_task: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    pub async fn new(config: AgentConfig, platform: PlatformServices) -> AgentResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let store: Arc<dyn StateStore> = match (platform.store, config.redis_url.as_deref()) {
            (Some(store), _) => store,
            (None, Some(url)) => Arc::new(RedisStateStore::connect(url, &config.driver_id).await?),
            (None, None) => {
                tracing::warn!("DRIVER_REDIS_URL not set, ride state will not survive a restart");
                Arc::new(MemoryStateStore::new())
            }
        };
        let store = StateStoreService::new(store);

        let routes: Arc<dyn RoutePlanner> = match (platform.routes, config.osrm_url.as_deref()) {
            (Some(routes), _) => routes,
            (None, Some(url)) => Arc::new(OsrmRoutePlanner::new(url)),
            (None, None) => {
                tracing::warn!("DRIVER_OSRM_URL not set, using straight-line routes");
                Arc::new(StraightLinePlanner)
            }
        };

        let hours_api = platform
            .hours_api
            .unwrap_or_else(|| Arc::new(HttpWorkingHoursApi::new(&config.api_base_url)));
        let completion_api = platform
            .completion_api
            .unwrap_or_else(|| Arc::new(HttpCompletionApi::new(&config.api_base_url)));

        let channel = Arc::new(DispatchChannel::new(platform.transport, &config));
        let outbox = Arc::new(CompletionOutbox::new(
            store.clone(),
            channel.clone(),
            completion_api,
            config.outbox_base_delay,
            config.outbox_max_delay,
        ));

        let (coordinator, coordinator_task) = RideCoordinator::spawn(CoordinatorDeps {
            config: config.clone(),
            channel,
            store: store.clone(),
            routes,
            sampler: platform.sampler,
            notifications: platform.notifications,
            hours_api,
            outbox: outbox.clone(),
        })
        .await?;

        tracing::info!("Driver agent ready for {}", config.driver_id);
        Ok(Self {
            coordinator,
            outbox,
            coordinator_task: Mutex::new(Some(coordinator_task)),
        })
    }

    /// Stop the coordinator and wait for its task to finish persisting state.
    pub async fn shutdown(&self) -> AgentResult<()> {
        let Some(task) = self.coordinator_task.lock().await.take() else {
            return Ok(());
        };
        self.coordinator.shutdown().await?;
        task.await.map_err(|e| {
            tracing::error!("Coordinator task failed: {}", e);
            AgentError::CoordinatorStopped
        })?;
        tracing::info!("Driver agent stopped");
        Ok(())
    }
}
