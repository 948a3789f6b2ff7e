// src/services/state_store.rs
//! Durable key/value store for state that must survive suspension and restart.
//!
//! The foreground coordinator and the background emitter never share memory;
//! everything they both need goes through here.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{AgentError, AgentResult};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> AgentResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> AgentResult<()>;
    async fn remove(&self, key: &str) -> AgentResult<()>;
}

pub struct StoreKeys;

impl StoreKeys {
    pub const RIDE_STATE: &'static str = "rideState";
    pub const DRIVER_ONLINE_STATE: &'static str = "driverOnlineState";
    pub const CURRENT_RIDE_STATUS: &'static str = "currentRideStatus";
    pub const PENDING_RIDE_COMPLETION: &'static str = "pendingRideCompletion";
    pub const PENDING_RIDE_REQUEST: &'static str = "pendingRideRequest";
    pub const RIDE_ACTION_INTENT: &'static str = "rideActionIntent";

    /// Redis keys are scoped per driver so several agents can share one instance.
    pub fn namespaced(driver_id: &str, key: &str) -> String {
        format!("driver:{}:{}", driver_id, key)
    }
}

// Redis-backed store
pub struct RedisStateStore {
    connection: redis::aio::MultiplexedConnection,
    driver_id: String,
}

impl RedisStateStore {
    pub async fn connect(redis_url: &str, driver_id: &str) -> AgentResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| AgentError::StoreConnection(e.to_string()))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| AgentError::StoreConnection(e.to_string()))?;

        tracing::info!("Connected state store to redis for driver: {}", driver_id);
        Ok(Self {
            connection,
            driver_id: driver_id.to_string(),
        })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(StoreKeys::namespaced(&self.driver_id, key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> AgentResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.set(StoreKeys::namespaced(&self.driver_id, key), value).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> AgentResult<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(StoreKeys::namespaced(&self.driver_id, key)).await?;
        Ok(())
    }
}

// In-memory store for tests and runs without redis
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> AgentResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AgentResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Typed JSON access on top of a [`StateStore`].
#[derive(Clone)]
pub struct StateStoreService {
    store: Arc<dyn StateStore>,
}

impl StateStoreService {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AgentError::StoreSerialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> AgentResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| AgentError::StoreSerialization(format!("{}: {}", key, e)))?;
        self.store.set(key, raw).await
    }

    pub async fn remove(&self, key: &str) -> AgentResult<()> {
        self.store.remove(key).await
    }

    /// Read and delete in one step. A corrupt value is dropped and reported as absent.
    pub async fn take_json<T: DeserializeOwned>(&self, key: &str) -> AgentResult<Option<T>> {
        let value = match self.get_json(key).await {
            Ok(value) => value,
            Err(AgentError::StoreSerialization(msg)) => {
                tracing::warn!("Discarding unreadable stored value: {}", msg);
                None
            }
            Err(e) => return Err(e),
        };
        self.store.remove(key).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: String,
        count: u32,
    }

    fn service() -> (Arc<MemoryStateStore>, StateStoreService) {
        let store = Arc::new(MemoryStateStore::new());
        (store.clone(), StateStoreService::new(store))
    }

    #[tokio::test]
    async fn json_values_survive_a_round_trip() {
        let (_, svc) = service();
        let probe = Probe { id: "R1".to_string(), count: 3 };
        svc.set_json("probe", &probe).await.unwrap();
        assert_eq!(svc.get_json::<Probe>("probe").await.unwrap(), Some(probe));
        svc.remove("probe").await.unwrap();
        assert_eq!(svc.get_json::<Probe>("probe").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_values_surface_as_serialization_errors() {
        let (store, svc) = service();
        store.set("probe", "{not json".to_string()).await.unwrap();
        assert!(matches!(
            svc.get_json::<Probe>("probe").await,
            Err(AgentError::StoreSerialization(_))
        ));
    }

    #[tokio::test]
    async fn take_removes_even_corrupt_values() {
        let (store, svc) = service();
        store.set("probe", "{not json".to_string()).await.unwrap();
        assert_eq!(svc.take_json::<Probe>("probe").await.unwrap(), None);
        assert!(store.keys().await.is_empty());
    }

    #[test]
    fn redis_keys_are_scoped_per_driver() {
        assert_eq!(StoreKeys::namespaced("drv-1", StoreKeys::RIDE_STATE), "driver:drv-1:rideState");
    }
}
