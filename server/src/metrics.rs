//! Business metrics for the pantry booking engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `pantry_bookings_created_total` - Bookings committed
//! - `pantry_bookings_rejected_total{reason}` - Bookings rejected, by error kind
//! - `pantry_lots_decremented_total` - Units taken from lots
//! - `pantry_cache_documents_upserted_total{kind}` - Cache documents written
//! - `pantry_cache_documents_failed_total{kind}` - Cache document writes that failed
//! - `pantry_idempotency_replays_total` - Responses replayed for a repeated key
//!
//! ## Histograms
//! - `pantry_cache_refresh_duration_seconds` - Bulk inventory refresh time
//!
//! # Example
//!
//! ```rust,no_run
//! use pantry_server::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Register metric descriptions, install the recorder and start the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        if self.started {
            return Ok(());
        }

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        builder
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_business_metrics();
        self.started = true;
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }
}

/// Initialize and register all business metrics descriptions.
pub fn register_business_metrics() {
    describe_counter!("pantry_bookings_created_total", "Total number of bookings committed");
    describe_counter!(
        "pantry_bookings_rejected_total",
        "Total number of bookings rejected, by reason"
    );
    describe_counter!(
        "pantry_lots_decremented_total",
        "Total number of units taken from lots"
    );
    describe_counter!(
        "pantry_cache_documents_upserted_total",
        "Total number of cache documents inserted or updated"
    );
    describe_counter!(
        "pantry_cache_documents_failed_total",
        "Total number of cache document writes that failed"
    );
    describe_histogram!(
        "pantry_cache_refresh_duration_seconds",
        "Time taken by a bulk inventory cache refresh"
    );
    describe_counter!(
        "pantry_idempotency_replays_total",
        "Total number of responses replayed for a repeated idempotency key"
    );

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a committed booking.
pub fn record_booking_created() {
    metrics::counter!("pantry_bookings_created_total").increment(1);
}

/// Record a rejected booking.
///
/// # Arguments
///
/// * `reason` - Error kind label (e.g. "conflict", "insufficient_quantity")
pub fn record_booking_rejected(reason: &'static str) {
    metrics::counter!("pantry_bookings_rejected_total", "reason" => reason).increment(1);
}

/// Record units taken from a lot.
pub fn record_lot_decremented(units: i32) {
    metrics::counter!("pantry_lots_decremented_total").increment(u64::from(units.unsigned_abs()));
}

/// Record cache writes for one refresh.
///
/// # Arguments
///
/// * `kind` - Document kind ("inventory" or "history")
/// * `upserted` - Documents inserted or updated
/// * `failed` - Documents whose write failed
pub fn record_cache_refresh(kind: &'static str, upserted: usize, failed: usize) {
    metrics::counter!("pantry_cache_documents_upserted_total", "kind" => kind)
        .increment(upserted as u64);
    metrics::counter!("pantry_cache_documents_failed_total", "kind" => kind)
        .increment(failed as u64);
}

/// Record the duration of a bulk inventory refresh.
pub fn record_refresh_duration(duration_secs: f64) {
    metrics::histogram!("pantry_cache_refresh_duration_seconds").record(duration_secs);
}

/// Record a replayed idempotent response.
pub fn record_idempotency_replay() {
    metrics::counter!("pantry_idempotency_replays_total").increment(1);
}
