//! Advisory key/value cache and the read-through device lookup built on it.
//!
//! Cache failures never fail a lookup: an error or an undecodable entry is
//! logged and treated as a miss.

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};
use crate::model::Device;
use crate::store::DeviceStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

/// Device lookups through the cache, falling back to the registry on a miss.
pub struct DeviceDirectory {
    store: Arc<dyn DeviceStore>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn DeviceStore>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    fn key(id: Uuid) -> String {
        format!("device:{}", id)
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<Device>> {
        let key = Self::key(id);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Device>(&raw) {
                Ok(device) => {
                    CACHE_HITS_TOTAL.inc();
                    return Ok(Some(device));
                }
                Err(e) => warn!(%key, "Discarding undecodable cache entry: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!(%key, "Cache read failed, loading from store: {}", e),
        }
        CACHE_MISSES_TOTAL.inc();

        let device = self.store.find(id).await?;
        // Unknown ids are not cached so a newly registered device is visible at once.
        if let Some(device) = &device {
            match serde_json::to_string(device) {
                Ok(raw) => {
                    if let Err(e) = self.cache.set(&key, raw, self.ttl).await {
                        warn!(%key, "Cache write failed: {}", e);
                    }
                }
                Err(e) => warn!(%key, "Failed to encode device for cache: {}", e),
            }
        } else {
            debug!(%id, "Device not found");
        }
        Ok(device)
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.find(id).await?.is_some())
    }
}
