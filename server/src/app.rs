//! Application wiring: pools, stores, service and background tasks.

use crate::config::{Config, PostgresConfig};
use crate::coordinator::BookingCoordinator;
use crate::gate::{IdempotencyGate, RedisRateLimiter, RedisReplayStore};
use crate::metrics::MetricsError;
use crate::scheduler::spawn_inventory_refresh;
use crate::service::{BookingService, ServiceSettings};
use crate::sync::{CacheSynchronizer, RefreshOptions};
use pantry_core::environment::{Clock, SystemClock};
use pantry_core::error::GateStoreError;
use pantry_postgres::{PostgresCacheStore, PostgresLedger, run_migrations};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors raised while starting or stopping the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// A database pool could not be created.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migrations failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis could not be reached.
    #[error("Redis error: {0}")]
    Redis(#[from] GateStoreError),

    /// The metrics exporter could not be started.
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Synchronizer over the production stores.
pub type PgSynchronizer = CacheSynchronizer<PostgresLedger, PostgresCacheStore>;

/// Booking service over the production stores.
pub type PgBookingService =
    BookingService<PostgresLedger, PostgresCacheStore, RedisReplayStore, RedisRateLimiter>;

/// The running pantry application.
pub struct PantryApp {
    config: Config,
    service: Arc<PgBookingService>,
    shutdown_tx: watch::Sender<bool>,
    refresh_task: Option<JoinHandle<()>>,
}

async fn connect_pool(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout))
        .idle_timeout(Duration::from_secs(config.idle_timeout))
        .connect(&config.url)
        .await
}

impl PantryApp {
    /// Connect to every backing store and run migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if a pool, migration or Redis connection fails.
    pub async fn new(config: Config) -> Result<Self, AppError> {
        let ledger_pool = connect_pool(&config.ledger).await?;
        run_migrations(&ledger_pool).await?;
        tracing::info!("✓ Ledger database ready");

        let cache_pool = if config.cache_db.url == config.ledger.url {
            ledger_pool.clone()
        } else {
            let pool = connect_pool(&config.cache_db).await?;
            run_migrations(&pool).await?;
            pool
        };
        tracing::info!("✓ Cache database ready");

        let replay_store = RedisReplayStore::new(&config.redis.url).await?;
        let limiter = RedisRateLimiter::new(&config.redis.url).await?;
        tracing::info!("✓ Redis ready");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = PostgresLedger::new(ledger_pool);
        let synchronizer = Arc::new(CacheSynchronizer::new(
            ledger.clone(),
            PostgresCacheStore::new(cache_pool),
            Arc::clone(&clock),
        ));

        let service = BookingService::new(
            BookingCoordinator::new(ledger, clock),
            synchronizer,
            IdempotencyGate::new(replay_store),
            limiter,
            ServiceSettings {
                idempotency_ttl: config.gate.idempotency_ttl(),
                rate_limit_requests: config.gate.rate_limit_requests,
                rate_limit_window: config.gate.rate_limit_window(),
                history_ttl_sec: config.cache.history_ttl_sec,
            },
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            service: Arc::new(service),
            shutdown_tx,
            refresh_task: None,
        })
    }

    /// The booking service, for collaborators that route requests into it.
    #[must_use]
    pub fn service(&self) -> Arc<PgBookingService> {
        Arc::clone(&self.service)
    }

    /// Start the scheduled inventory refresh.
    pub fn start(&mut self) {
        if self.refresh_task.is_some() {
            return;
        }
        let options = RefreshOptions {
            reconcile_deletes: self.config.cache.reconcile_deletes,
            ttl_sec: self.config.cache.ttl_sec,
        };
        self.refresh_task = Some(spawn_inventory_refresh(
            Arc::clone(self.service.synchronizer()),
            self.config.cache.refresh_interval(),
            options,
            self.shutdown_tx.subscribe(),
        ));
        tracing::info!(
            interval_sec = self.config.cache.refresh_interval_sec,
            "Inventory refresh scheduled"
        );
    }

    /// Stop background tasks, waiting at most the configured shutdown timeout.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.refresh_task.take() {
            let timeout = Duration::from_secs(self.config.server.shutdown_timeout);
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!("Inventory refresh did not stop within the shutdown timeout");
            }
        }
        tracing::info!("Shutdown complete");
    }
}
