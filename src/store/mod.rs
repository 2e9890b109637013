//! Shared counter store abstraction.
//!
//! The gate keeps all mutable state in an external key-value store. This
//! module defines the narrow interface the admission and decay logic consume,
//! plus a Redis client and an in-process implementation.

mod memory;
mod redis_store;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryCounterStore;
pub use redis_store::RedisCounterStore;

/// Errors returned by a counter store.
///
/// A missing key is never an error: reads return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport or protocol failure talking to Redis
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The command did not complete within the configured timeout
    #[error("store command `{command}` timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },

    /// Increment or decrement applied to a value that is not an integer
    #[error("value stored at `{key}` is not an integer")]
    NotAnInteger { key: String },

    /// Store is unavailable for another reason
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value operations the rate limiter needs from the shared store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the raw value at `key`, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically increment `key`, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Atomically decrement `key` and return the new value.
    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Replace the value at `key`, expiring it after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
}
