//! In-process counter store.
//!
//! Mirrors the Redis semantics the gate relies on (INCR/DECR on absent keys,
//! integer checks, per-key TTL) so the limiter can run without a server in
//! tests and single-node development. Expiry follows tokio's clock, which lets
//! paused-time tests drive TTLs deterministically.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`CounterStore`] held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Slot>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_expired(now) {
                    *slot = Slot {
                        value: delta.to_string(),
                        expires_at: None,
                    };
                    return Ok(delta);
                }

                let current: i64 = slot.value.parse().map_err(|_| StoreError::NotAnInteger {
                    key: key.to_string(),
                })?;
                let updated = current + delta;
                // INCR/DECR keep the existing TTL
                slot.value = updated.to_string();
                Ok(updated)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: delta.to_string(),
                    expires_at: None,
                });
                Ok(delta)
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        Ok(self.entries.get(key).map(|slot| slot.value.clone()))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, 1)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        self.add(key, -1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }
}
