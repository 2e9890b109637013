//! Rate limiting logic: identities, admission and decay.

mod admission;
mod api_keys;
mod decay;
mod identity;

pub use admission::{AdmissionController, Decision, RejectReason, BLOCKED_SENTINEL};
pub use api_keys::{ApiKeyError, ApiKeyRecord, ApiKeyRegistry};
pub use decay::{release, DecayOutcome, DecayScheduler, DECAY_DELAY};
pub use identity::{
    client_ip, Identity, IdentityResolver, ResolvedIdentity, API_KEY_HEADER, KEY_PREFIX,
    UNKNOWN_PEER,
};
