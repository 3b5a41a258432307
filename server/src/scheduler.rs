//! Timer that drives bulk inventory refreshes.
//!
//! Overlapping firings are harmless: the synchronizer's single-flight permit
//! turns a tick that lands during a running refresh into a no-op.

use crate::sync::{BulkRefresh, CacheSynchronizer, RefreshOptions};
use pantry_core::cache::CacheStore;
use pantry_core::ledger::Ledger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Shortest period the scheduler will tick at.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a task that refreshes the inventory cache every `interval` until
/// `shutdown` turns `true` or its sender is dropped.
///
/// The first refresh runs immediately. An `interval` below
/// [`MIN_REFRESH_INTERVAL`] is raised to it.
pub fn spawn_inventory_refresh<L, C>(
    synchronizer: Arc<CacheSynchronizer<L, C>>,
    interval: Duration,
    options: RefreshOptions,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    L: Ledger + 'static,
    C: CacheStore + 'static,
{
    let period = if interval < MIN_REFRESH_INTERVAL {
        tracing::warn!(
            requested = ?interval,
            minimum = ?MIN_REFRESH_INTERVAL,
            "Refresh interval too short, using the minimum"
        );
        MIN_REFRESH_INTERVAL
    } else {
        interval
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match synchronizer.refresh_inventory(options).await {
                        Ok(BulkRefresh::Completed(report)) => {
                            tracing::debug!(count = report.count, failed = report.failed, "Scheduled refresh finished");
                        }
                        Ok(BulkRefresh::AlreadyRunning) => {
                            tracing::debug!("Scheduled refresh skipped, previous run still active");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Scheduled inventory refresh failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Inventory refresh scheduler stopping");
                        break;
                    }
                }
            }
        }
    })
}
