use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::{build_router, Gate, HttpServer};
use turnstile::ratelimit::ApiKeyRegistry;
use turnstile::store::RedisCounterStore;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate limiting gate in front of an HTTP application.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the API key list path
    #[arg(long)]
    api_keys: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        TurnstileConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(addr) = args.listen {
        config.server.http_addr = addr;
    }
    if let Some(path) = args.api_keys {
        config.api_keys.path = path;
    }
    info!(
        http_addr = %config.server.http_addr,
        default_limit = config.limits.default_limit,
        api_key_limit = config.limits.api_key_limit,
        block_ms = config.limits.block_duration_ms,
        "Configuration loaded"
    );

    let api_keys = ApiKeyRegistry::from_file(&config.api_keys.path)
        .with_context(|| format!("failed to load API keys from {}", config.api_keys.path))?;

    let store = RedisCounterStore::connect(&config.store)
        .await
        .context("failed to connect to the counter store")?;
    info!("Counter store connected");

    let gate = Arc::new(Gate::new(
        &config.limits,
        Arc::new(api_keys),
        Arc::new(store),
    ));

    let server = HttpServer::new(config.server.http_addr, build_router(gate));
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
