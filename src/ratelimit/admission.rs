//! Admission control against the shared counter store.
//!
//! Each identity owns one counter entry. A request is admitted while the
//! counter is below the identity's limit; the request that finds the counter
//! at the limit replaces it with [`BLOCKED_SENTINEL`] for the blocking
//! duration, and every request that finds the sentinel is rejected outright.
//!
//! The read, the limit check and the write are separate store commands and
//! are not serialized per identity. Only the increment itself is atomic, so
//! concurrent requests that all observe `limit - 1` can all be admitted before
//! the sentinel lands. Enforcement is therefore approximate under contention.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::identity::Identity;
use crate::store::{CounterStore, StoreError};

/// Value stored in place of the counter while an identity is blocked.
pub const BLOCKED_SENTINEL: &str = "blocked";

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The identity is serving a block from an earlier overrun
    Blocked,
    /// This request found the counter at the limit and started a block
    LimitExceeded,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request; `count` is the counter value after this admission
    Admit { count: i64 },
    /// Reject with a rate limit response
    Reject(RejectReason),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }
}

/// Fixed-window admission policy with a blocking penalty.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    block_duration: Duration,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CounterStore>, block_duration: Duration) -> Self {
        Self {
            store,
            block_duration,
        }
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Decide whether a request for `identity` may proceed under `limit`.
    ///
    /// Store failures are returned as errors for the caller to map onto an
    /// infrastructure response; they are not retried here.
    pub async fn decide(&self, identity: &Identity, limit: u64) -> Result<Decision, StoreError> {
        let key = identity.store_key();

        let current = self.store.get(&key).await?;

        if current.as_deref() == Some(BLOCKED_SENTINEL) {
            debug!(identity = %identity, "Identity is blocked");
            return Ok(Decision::Reject(RejectReason::Blocked));
        }

        // Absent or unparsable counters count as zero
        let count = current
            .as_deref()
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);

        trace!(identity = %identity, count, limit, "Checking rate limit");

        if count >= i64::try_from(limit).unwrap_or(i64::MAX) {
            self.block(identity, &key).await;
            info!(
                identity = %identity,
                limit,
                block_ms = self.block_duration.as_millis() as u64,
                "Rate limit exceeded, identity blocked"
            );
            return Ok(Decision::Reject(RejectReason::LimitExceeded));
        }

        let count = self.store.increment(&key).await?;
        Ok(Decision::Admit { count })
    }

    async fn block(&self, identity: &Identity, key: &str) {
        if let Err(e) = self
            .store
            .set(key, BLOCKED_SENTINEL, self.block_duration)
            .await
        {
            // The request is rejected either way; the next one re-checks the counter
            warn!(identity = %identity, error = %e, "Failed to store block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn controller(store: Arc<MemoryCounterStore>) -> AdmissionController {
        AdmissionController::new(store, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_first_request_creates_counter() {
        let store = Arc::new(MemoryCounterStore::new());
        let admission = controller(store.clone());
        let identity = Identity::Ip("10.0.0.1".to_string());

        let decision = admission.decide(&identity, 5).await.unwrap();
        assert_eq!(decision, Decision::Admit { count: 1 });
        assert_eq!(
            store.get("rate-limiter:10.0.0.1").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_limit_then_block() {
        let store = Arc::new(MemoryCounterStore::new());
        let admission = controller(store.clone());
        let identity = Identity::ApiKey(1);

        for i in 1..=3 {
            let decision = admission.decide(&identity, 3).await.unwrap();
            assert_eq!(decision, Decision::Admit { count: i }, "request {} should pass", i);
        }

        let decision = admission.decide(&identity, 3).await.unwrap();
        assert_eq!(decision, Decision::Reject(RejectReason::LimitExceeded));
        assert_eq!(
            store.get("rate-limiter:1").await.unwrap().as_deref(),
            Some(BLOCKED_SENTINEL)
        );

        let decision = admission.decide(&identity, 3).await.unwrap();
        assert_eq!(decision, Decision::Reject(RejectReason::Blocked));
    }

    #[tokio::test]
    async fn test_unparsable_counter_counts_as_zero() {
        let store = Arc::new(MemoryCounterStore::new());
        store
            .set("rate-limiter:1", "garbage", Duration::from_secs(60))
            .await
            .unwrap();
        let admission = controller(store.clone());

        // Parsed as zero, so the limit check passes; the increment itself then
        // hits the non-integer value and surfaces as a store error.
        let result = admission.decide(&Identity::ApiKey(1), 5).await;
        assert!(matches!(result, Err(StoreError::NotAnInteger { .. })));
    }

    #[tokio::test]
    async fn test_blocked_ignores_limit() {
        let store = Arc::new(MemoryCounterStore::new());
        store
            .set("rate-limiter:1", BLOCKED_SENTINEL, Duration::from_secs(60))
            .await
            .unwrap();
        let admission = controller(store);

        let decision = admission.decide(&Identity::ApiKey(1), 1_000).await.unwrap();
        assert_eq!(decision, Decision::Reject(RejectReason::Blocked));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires() {
        let store = Arc::new(MemoryCounterStore::new());
        let admission = AdmissionController::new(store, Duration::from_secs(5));
        let identity = Identity::Ip("10.0.0.1".to_string());

        assert!(admission.decide(&identity, 1).await.unwrap().is_admitted());
        assert!(!admission.decide(&identity, 1).await.unwrap().is_admitted());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            admission.decide(&identity, 1).await.unwrap(),
            Decision::Reject(RejectReason::Blocked)
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            admission.decide(&identity, 1).await.unwrap(),
            Decision::Admit { count: 1 }
        );
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let store = Arc::new(MemoryCounterStore::new());
        let admission = controller(store);

        let a = Identity::Ip("10.0.0.1".to_string());
        let b = Identity::Ip("10.0.0.2".to_string());

        assert!(admission.decide(&a, 1).await.unwrap().is_admitted());
        assert!(!admission.decide(&a, 1).await.unwrap().is_admitted());
        assert!(admission.decide(&b, 1).await.unwrap().is_admitted());
    }
}
