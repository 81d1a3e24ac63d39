use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::Cache;
use crate::errors::{Error, Result};

pub const KEY_PREFIX: &str = "IoTPlatform_";

/// Redis-backed cache shared by every instance of the service.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis cache...");
        let client = redis::Client::open(url).map_err(|e| Error::Cache(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        info!("Redis cache connection established");
        Ok(Self { connection })
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        connection
            .get::<_, Option<String>>(Self::key(key))
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut connection = self.connection.clone();
        let seconds = ttl.as_secs().max(1);
        connection
            .set_ex::<_, _, ()>(Self::key(key), value, seconds)
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }
}
