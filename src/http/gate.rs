//! The admission gate as an axum middleware.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info_span, Instrument};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::ratelimit::{
    AdmissionController, ApiKeyRegistry, DecayScheduler, Decision, IdentityResolver, RejectReason,
    ResolvedIdentity,
};
use crate::store::{CounterStore, StoreError};

/// Body of every 429 response.
pub const RATE_LIMITED_BODY: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body of every 500 response caused by the counter store.
pub const INTERNAL_ERROR_BODY: &str = "Internal server error";

/// Request id header, honoured when present and generated otherwise.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Terminal outcomes of the gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("rate limited: {0:?}")]
    RateLimited(RejectReason),

    #[error("counter store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match self {
            GateError::RateLimited(_) => {
                plain_error(StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY)
            }
            GateError::Store(_) => {
                plain_error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY)
            }
        }
    }
}

/// Plain-text error response: the message plus a trailing newline, never sniffed.
pub fn plain_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        format!("{}\n", message),
    )
        .into_response()
}

/// Identity resolution, admission and decay composed in front of a handler.
///
/// Holds only immutable configuration and the store handle, so one instance
/// is shared by every request.
pub struct Gate {
    store: Arc<dyn CounterStore>,
    resolver: IdentityResolver,
    admission: AdmissionController,
    decay: DecayScheduler,
}

impl Gate {
    pub fn new(
        limits: &LimitsConfig,
        api_keys: Arc<ApiKeyRegistry>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(api_keys, limits),
            admission: AdmissionController::new(Arc::clone(&store), limits.block_duration()),
            decay: DecayScheduler::new(Arc::clone(&store)),
            store,
        }
    }

    /// Override the delay before an admission's quota is released.
    pub fn with_decay_delay(mut self, delay: Duration) -> Self {
        self.decay = DecayScheduler::with_delay(Arc::clone(&self.store), delay);
        self
    }

    /// Run the admission check for one request.
    ///
    /// On success a release is already scheduled and the caller should run the
    /// downstream handler. The check and the scheduling run on their own task,
    /// so a request dropped mid-check (client gone) still gets its increment
    /// paired with a release.
    pub async fn admit(
        &self,
        headers: &HeaderMap,
        peer_addr: Option<&str>,
    ) -> Result<ResolvedIdentity, GateError> {
        let resolved = self.resolver.resolve(headers, peer_addr);

        let admission = self.admission.clone();
        let decay = self.decay.clone();
        let identity = resolved.identity.clone();
        let limit = resolved.limit;

        let check = tokio::spawn(
            async move {
                let decision = admission.decide(&identity, limit).await?;
                if decision.is_admitted() {
                    // Detached: the request never waits on the release
                    decay.schedule(identity.store_key());
                }
                Ok::<_, StoreError>(decision)
            }
            .in_current_span(),
        );

        let outcome = match check.await {
            Ok(outcome) => outcome,
            Err(e) => Err(StoreError::Unavailable(format!("admission task failed: {}", e))),
        };

        match outcome {
            Ok(Decision::Admit { .. }) => Ok(resolved),
            Ok(Decision::Reject(reason)) => Err(GateError::RateLimited(reason)),
            Err(e) => {
                error!(identity = %resolved.identity, error = %e, "Rate limit check failed");
                Err(GateError::Store(e))
            }
        }
    }

    /// Put this gate in front of every route of `router`.
    pub fn wrap(self: Arc<Self>, router: Router) -> Router {
        router.layer(middleware::from_fn_with_state(self, rate_limit))
    }
}

/// Middleware entry point; see [`Gate::wrap`].
pub async fn rate_limit(State(gate): State<Arc<Gate>>, request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let peer_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string());

        let outcome = gate.admit(request.headers(), peer_addr.as_deref()).await;
        let mut response = match outcome {
            Ok(_) => next.run(request).await,
            Err(rejection) => rejection.into_response(),
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }
    .instrument(span)
    .await
}
