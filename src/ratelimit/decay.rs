//! Background counter decay.
//!
//! Every admission schedules one release: after [`DECAY_DELAY`] the counter
//! is decremented and, once it is back to zero, deleted. This leaks one unit
//! per admission per second and turns the fixed counter into an approximate
//! rolling window.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::store::CounterStore;

/// How long after an admission its unit of quota is released.
pub const DECAY_DELAY: Duration = Duration::from_secs(1);

/// What a release did to the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayOutcome {
    /// Counter decremented and still positive
    Decremented(i64),
    /// Counter reached zero and the key was removed
    Deleted,
    /// A store call failed; the entry is left to self-heal
    Failed,
}

/// Spawns detached release tasks for admitted requests.
#[derive(Clone)]
pub struct DecayScheduler {
    store: Arc<dyn CounterStore>,
    delay: Duration,
}

impl DecayScheduler {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_delay(store, DECAY_DELAY)
    }

    pub fn with_delay(store: Arc<dyn CounterStore>, delay: Duration) -> Self {
        Self { store, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule the release of one unit on `key`.
    ///
    /// The task runs independently of the caller: dropping the returned
    /// handle does not cancel it, and its failures are only logged.
    pub fn schedule(&self, key: String) -> JoinHandle<DecayOutcome> {
        let store = Arc::clone(&self.store);
        let delay = self.delay;
        let span = tracing::debug_span!("decay", key = %key);

        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                release(store.as_ref(), &key).await
            }
            .instrument(span),
        )
    }
}

/// Decrement `key` and delete it once the counter is exhausted.
///
/// A counter that lands below zero is deleted as well: that only happens when
/// the entry vanished (expired or replaced) before the release ran, and a
/// negative count would otherwise grant extra quota with no TTL.
pub async fn release(store: &dyn CounterStore, key: &str) -> DecayOutcome {
    let remaining = match store.decrement(key).await {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Could not decrement counter");
            return DecayOutcome::Failed;
        }
    };

    if remaining > 0 {
        debug!(key, remaining, "Counter decremented");
        return DecayOutcome::Decremented(remaining);
    }

    match store.delete(key).await {
        Ok(()) => {
            debug!(key, "Counter drained, key removed");
            DecayOutcome::Deleted
        }
        Err(e) => {
            warn!(key, error = %e, "Could not delete key");
            DecayOutcome::Failed
        }
    }
}
