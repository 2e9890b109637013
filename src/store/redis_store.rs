//! Redis-backed counter store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::FromRedisValue;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{CounterStore, StoreError};
use crate::config::StoreConfig;

/// A [`CounterStore`] talking to Redis through a reconnecting connection manager.
///
/// Every command is bounded by `command_timeout` so callers (in particular
/// detached decay tasks) never wait on the network indefinitely.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect using the store configuration and verify the server answers PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.connection_url();
        let command_timeout = config.command_timeout();

        info!(address = %config.address, db = config.db, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let connection = tokio::time::timeout(command_timeout * 4, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout {
                command: "CONNECT",
                timeout: command_timeout * 4,
            })??;

        let store = Self {
            connection,
            command_timeout,
        };

        let pong: String = store.run("PING", redis::cmd("PING")).await?;
        debug!(reply = %pong, "Redis answered PING");

        Ok(store)
    }

    async fn run<T>(&self, command: &'static str, cmd: redis::Cmd) -> Result<T, StoreError>
    where
        T: FromRedisValue,
    {
        let mut conn = self.connection.clone();
        self.bounded(command, async move { cmd.query_async::<T>(&mut conn).await })
            .await
    }

    async fn bounded<T, F>(&self, command: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(|e| map_redis_error(e, command)),
            Err(_) => Err(StoreError::Timeout {
                command,
                timeout: self.command_timeout,
            }),
        }
    }
}

fn map_redis_error(error: redis::RedisError, command: &'static str) -> StoreError {
    debug!(command, error = %error, "Redis command failed");
    StoreError::Redis(error)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("GET", cmd).await
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        self.run("INCR", cmd).await
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("DECR");
        cmd.arg(key);
        self.run("DECR", cmd).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _removed: i64 = self.run("DEL", cmd).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64);
        let _: () = self.run("SET", cmd).await?;
        Ok(())
    }
}
