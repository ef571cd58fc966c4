//! Optional Redis-backed cache.
//!
//! The cache is a best-effort layer: when no Redis URL is configured every
//! operation is a no-op, and when Redis misbehaves the error is logged at
//! debug level and swallowed — callers always have a database fallback.

use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Best-effort key/value cache with TTLs.
#[derive(Clone)]
pub struct Cache {
    client: Option<redis::Client>,
}

impl Cache {
    /// Build from a Redis URL. An empty URL or an unparsable one yields a
    /// disabled cache — the core must keep working without Redis.
    pub fn from_url(url: &str) -> Self {
        if url.trim().is_empty() {
            return Self::disabled();
        }
        match redis::Client::open(url) {
            Ok(client) => Self {
                client: Some(client),
            },
            Err(e) => {
                warn!("invalid redis url, caching disabled: {e}");
                Self::disabled()
            }
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.client.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!("redis connection failed: {e}");
                None
            }
        }
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!("redis GET {key} failed: {e}");
                None
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await {
            debug!("redis SETEX {key} failed: {e}");
        }
    }

    pub async fn del(&self, key: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(key).await {
            debug!("redis DEL {key} failed: {e}");
        }
    }

    /// Fetch and deserialize a JSON payload; any failure reads as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_string(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("redis cached JSON at {key} is malformed: {e}");
                None
            }
        }
    }

    /// Serialize and store a JSON payload with a TTL.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_ex(key, &raw, ttl_seconds).await,
            Err(e) => debug!("failed to serialize cache value for {key}: {e}"),
        }
    }
}
