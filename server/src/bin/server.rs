//! Pantry Booking Server
//!
//! Main server process that runs the pantry booking engine.
//!
//! This binary:
//! - Initializes the `PostgreSQL` ledger and read cache (running migrations)
//! - Connects to `Redis` for idempotency records and rate limiting
//! - Starts the Prometheus metrics exporter
//! - Schedules bulk inventory cache refreshes
//! - Runs until Ctrl+C
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run server
//! cargo run --bin pantry-server
//! ```

use pantry_server::metrics::MetricsServer;
use pantry_server::{AppError, Config, PantryApp};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pantry_server=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Pantry Booking Server...");

    let config = Config::from_env();
    tracing::info!(
        cache_ttl_sec = config.cache.ttl_sec,
        refresh_interval_sec = config.cache.refresh_interval_sec,
        rate_limit_requests = config.gate.rate_limit_requests,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    MetricsServer::new(metrics_addr)
        .start()
        .map_err(AppError::from)?;

    let mut app = PantryApp::new(config).await?;
    app.start();
    tracing::info!("Pantry Booking Server is running. Press Ctrl+C to shutdown");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down gracefully...");
    app.shutdown().await;
    Ok(())
}
