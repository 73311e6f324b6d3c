//! Key/value cache adapter: one capability contract, Redis behind it.
//!
//! List values are JSON-encoded on `push`; `push` inserts at the head and
//! `pop` removes from the tail, so `pop` always yields the least recently
//! pushed item. Missing keys are not errors: `pop` returns an empty string
//! and `len` returns -1.

use crate::config::{CacheConfig, CacheType};
use crate::error::CacheError;
use crate::shutdown::Shutdown;
use crate::storage::RECONNECT_DELAY;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The configured cache backend.
pub enum Cache {
    Redis(RedisCache),
}

impl Cache {
    /// Construct the backend selected by the configuration, retrying until
    /// it is live.
    pub async fn connect(config: &CacheConfig) -> Cache {
        match config.kind {
            CacheType::Redis => Cache::Redis(RedisCache::connect(&config.dsn).await),
        }
    }

    pub fn init(&mut self, enabled: bool) {
        match self {
            Cache::Redis(c) => c.init(enabled),
        }
    }

    pub async fn stop(&mut self) {
        match self {
            Cache::Redis(c) => c.stop(),
        }
    }

    /// `Ok(None)` when the key is absent; errors are transport faults.
    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self {
            Cache::Redis(c) => c.get(key).await,
        }
    }

    /// A zero `ttl` stores the value without expiry.
    pub async fn set<V>(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        match self {
            Cache::Redis(c) => c.set(key, value, ttl).await,
        }
    }

    /// Transport errors swallow to `false`.
    pub async fn exists(&self, key: &str) -> bool {
        match self {
            Cache::Redis(c) => c.exists(key).await,
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        match self {
            Cache::Redis(c) => c.expire(key, ttl).await,
        }
    }

    /// JSON-encode `value` and insert it at the head of the list at `key`.
    pub async fn push<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        match self {
            Cache::Redis(c) => c.push(key, value).await,
        }
    }

    /// Remove and return the tail of the list at `key`; empty or missing
    /// lists yield an empty string.
    pub async fn pop(&self, key: &str) -> Result<String, CacheError> {
        match self {
            Cache::Redis(c) => c.pop(key).await,
        }
    }

    /// Length of the list at `key`; -1 when the key is missing.
    pub async fn len(&self, key: &str) -> Result<i64, CacheError> {
        match self {
            Cache::Redis(c) => c.len(key).await,
        }
    }

    /// The adapter's cancellable context; `stop` triggers it.
    pub fn shutdown(&self) -> &Shutdown {
        match self {
            Cache::Redis(c) => &c.shutdown,
        }
    }
}

/// Redis-protocol cache over a reconnecting managed connection.
pub struct RedisCache {
    conn: ConnectionManager,
    shutdown: Shutdown,
}

impl RedisCache {
    /// Parse the DSN and connect, retrying until the server answers a PING.
    pub async fn connect(dsn: &str) -> RedisCache {
        debug!("connecting to redis");
        let conn = loop {
            let client = match redis::Client::open(dsn) {
                Ok(client) => client,
                Err(e) => {
                    error!("could not parse dsn: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection to redis");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let mut conn = match client.get_connection_manager().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("could not connect to redis: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection to redis");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
            match pong {
                Ok(_) => break conn,
                Err(e) => {
                    error!("could not connect to redis: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection to redis");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };

        info!("connected to redis");
        RedisCache {
            conn,
            shutdown: Shutdown::new(),
        }
    }

    pub fn init(&mut self, enabled: bool) {
        if !enabled {
            debug!("cache is disabled in the config, skipping initialization");
            return;
        }
        debug!("redis cache initialized");
    }

    /// Cancel the adapter context; in-flight operations return `Stopped`.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        info!("redis client closed");
    }

    /// Run one command, bailing out if the adapter is stopped meanwhile.
    async fn run<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let mut stop = self.shutdown.subscribe();
        tokio::select! {
            result = op => Ok(result?),
            _ = stop.recv() => Err(CacheError::Stopped),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.run(async move { conn.get(key).await }).await
    }

    pub async fn set<V>(&self, key: &str, value: V, ttl: Duration) -> Result<(), CacheError>
    where
        V: redis::ToRedisArgs + Send + Sync,
    {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        if ttl.is_zero() {
            self.run(async move { conn.set(key, value).await }).await
        } else {
            let seconds = ttl.as_secs();
            self.run(async move { conn.set_ex(key, value, seconds).await })
                .await
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.run(async move { conn.exists(key).await })
            .await
            .unwrap_or(false)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let seconds = ttl.as_secs() as i64;
        let _: bool = self
            .run(async move { conn.expire(key, seconds).await })
            .await?;
        Ok(())
    }

    pub async fn push<T>(&self, key: &str, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_string(value)?;
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let _: i64 = self.run(async move { conn.lpush(key, data).await }).await?;
        Ok(())
    }

    pub async fn pop(&self, key: &str) -> Result<String, CacheError> {
        if !self.exists(key).await {
            return Ok(String::new());
        }
        let mut conn = self.conn.clone();
        let key = key.to_string();
        let value: Option<String> = self.run(async move { conn.rpop(key, None).await }).await?;
        Ok(value.unwrap_or_default())
    }

    pub async fn len(&self, key: &str) -> Result<i64, CacheError> {
        if !self.exists(key).await {
            return Ok(-1);
        }
        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.run(async move { conn.llen(key).await }).await
    }
}
