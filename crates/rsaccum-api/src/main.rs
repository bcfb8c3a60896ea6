//! rsaccum server binary
//!
//! HTTP-fronted request accumulator and dispatcher.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! rsaccum --config config.yaml
//!
//! # With environment variables only
//! ACCUM_STORAGE__BACKEND=redis REDIS_URL=redis://localhost:6379 rsaccum
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};

use rsaccum_api::http::{create_router_with_body_limit, AppState};
use rsaccum_api::observability::{init_logging, LoggingConfig};
use rsaccum_server::ServerConfig;
use rsaccum_storage::{Backend, MemoryStore, RedisStore};

/// Flush delay applied to buffers found at startup. Armed timers are
/// process-local, so buffers surviving a restart get a short fuse.
const RECOVERY_FLUSH_DELAY: Duration = Duration::from_secs(5);

/// rsaccum - HTTP request accumulator and dispatcher
#[derive(Parser, Debug)]
#[command(name = "rsaccum")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::from_env()?
    };

    init_logging(LoggingConfig {
        json_format: config.logging.json,
        default_level: parse_log_level(&config.logging.level),
    });

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rsaccum server");
    if !config.security.allowed_ips.is_empty() {
        info!(allowed = ?config.security.allowed_ips, "advisory IP allow-list configured");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    match config.storage.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage backend");
            let storage = Arc::new(MemoryStore::new());
            run_server(storage, &config, addr).await
        }
        "redis" => {
            let redis_url = config.storage.redis_url.clone().ok_or_else(|| {
                anyhow::anyhow!("storage.redis_url is required for the redis backend")
            })?;
            info!("Connecting to Redis");
            let storage = Arc::new(RedisStore::connect(&redis_url).await?);
            info!("Redis connection established");
            run_server(storage, &config, addr).await
        }
        other => anyhow::bail!("Unknown storage backend: {other}"),
    }
}

/// Build the application state, recover surviving buffers, and serve.
async fn run_server<S: Backend>(
    storage: Arc<S>,
    config: &ServerConfig,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let state = AppState::new(storage, config);

    let recovered = state.scheduler.recover(RECOVERY_FLUSH_DELAY).await?;
    if recovered > 0 {
        info!(recovered, "scheduled recovery flushes for surviving buffers");
    }

    let router = create_router_with_body_limit(state, config.server.body_limit_bytes);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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

/// Parse log level from string.
fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
