//! HTTP server implementation.

use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{error, info, Level};

use super::gate::{plain_error, Gate, INTERNAL_ERROR_BODY};
use crate::error::{Result, TurnstileError};

/// Build the application router with the gate in front of every route.
pub fn build_router(gate: Arc<Gate>) -> Router {
    gate_routes(gate, Router::new().route("/", get(welcome)))
}

/// Put `routes` behind the gate.
///
/// Layers from the outside in: access log (status and latency per request),
/// the gate, then panic recovery so a failing handler answers 500.
pub fn gate_routes(gate: Arc<Gate>, routes: Router) -> Router {
    let routes = routes.layer(CatchPanicLayer::custom(panic_response));

    gate.wrap(routes).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(
                DefaultOnResponse::new()
                    .level(Level::INFO)
                    .latency_unit(LatencyUnit::Millis),
            ),
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = message, "Handler panicked");

    plain_error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY)
}

async fn welcome() -> &'static str {
    "welcome"
}

/// HTTP server for the gated application.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Fully assembled router
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Bind and serve until `signal` resolves, then drain in-flight requests.
    ///
    /// Connections carry their peer address so the gate can fall back to it
    /// when no forwarding headers are present.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use crate::ratelimit::ApiKeyRegistry;
    use crate::store::MemoryCounterStore;

    fn test_gate() -> Arc<Gate> {
        Arc::new(Gate::new(
            &LimitsConfig::default(),
            Arc::new(ApiKeyRegistry::default()),
            Arc::new(MemoryCounterStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, build_router(test_gate()));

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }

    async fn explode() -> &'static str {
        panic!("handler failed")
    }

    #[tokio::test]
    async fn test_panicking_handler_answers_500() {
        let app = gate_routes(test_gate(), Router::new().route("/boom", get(explode)));

        let request = Request::builder().uri("/boom").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, format!("{}\n", INTERNAL_ERROR_BODY).as_bytes());
    }

    #[tokio::test]
    async fn test_welcome_route_is_gated() {
        let app = build_router(test_gate());

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(crate::http::REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let server = HttpServer::new(addr, build_router(test_gate()));
        let result = server.serve_with_shutdown(async {}).await;
        assert!(matches!(result, Err(TurnstileError::Io(_))));
    }
}
