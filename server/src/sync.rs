//! Cache synchronizer: projects committed ledger rows into the read cache.
//!
//! The synchronizer is the only writer of the cache store. It reads from the
//! ledger, stamps every document with staleness metadata and upserts it under
//! a stable key, so running a refresh twice changes nothing but the stamps.
//!
//! Per-document write failures are logged, counted and skipped. Only a total
//! failure to reach a data source is returned to the caller.
//!
//! Bulk inventory refreshes are single-flight: the synchronizer owns a
//! one-permit semaphore, and a trigger that finds it taken returns
//! [`BulkRefresh::AlreadyRunning`] immediately.

use crate::metrics;
use pantry_core::cache::{
    CacheStamp, CacheStore, HistoryDocument, InventoryDocument, InventoryFilter, UpsertOutcome,
};
use pantry_core::environment::Clock;
use pantry_core::error::{CacheError, LedgerError};
use pantry_core::ledger::Ledger;
use pantry_core::types::{BookingId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors that abort a whole refresh or read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The authoritative store could not be read.
    #[error("Failed to read ledger: {0}")]
    Ledger(#[from] LedgerError),

    /// The cache store could not be read.
    #[error("Failed to read cache: {0}")]
    Cache(#[from] CacheError),

    /// The requested TTL is not positive or does not fit in a timestamp.
    #[error("Invalid cache TTL: {0} seconds")]
    InvalidTtl(i64),
}

/// Options for a bulk inventory refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshOptions {
    /// Remove cached documents whose lot is no longer in the ledger
    pub reconcile_deletes: bool,
    /// TTL stamped on every document, in seconds
    pub ttl_sec: i64,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self {
            reconcile_deletes: true,
            ttl_sec: 300,
        }
    }
}

/// Counts from one refresh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Documents projected from the ledger
    pub count: usize,
    /// Documents inserted or whose business fields changed
    pub upserted: usize,
    /// Documents whose business fields were already current
    pub unchanged: usize,
    /// Documents removed during reconciliation
    pub removed: u64,
    /// Documents whose write failed
    pub failed: usize,
}

impl RefreshReport {
    fn record(&mut self, key: &str, result: Result<UpsertOutcome, CacheError>) {
        match result {
            Ok(UpsertOutcome::Inserted | UpsertOutcome::Updated) => self.upserted += 1,
            Ok(UpsertOutcome::Unchanged) => self.unchanged += 1,
            Err(e) => {
                self.failed += 1;
                tracing::warn!(key, error = %e, "Cache document write failed, skipping");
            }
        }
    }
}

/// Result of triggering a bulk refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkRefresh {
    /// This call ran the refresh
    Completed(RefreshReport),
    /// Another refresh was already in progress; nothing was done
    AlreadyRunning,
}

/// Write-through projector from the ledger to the cache store.
pub struct CacheSynchronizer<L, C> {
    ledger: L,
    cache: C,
    clock: Arc<dyn Clock>,
    bulk_permit: Semaphore,
}

impl<L: Ledger, C: CacheStore> CacheSynchronizer<L, C> {
    /// Create a synchronizer.
    #[must_use]
    pub fn new(ledger: L, cache: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            cache,
            clock,
            bulk_permit: Semaphore::new(1),
        }
    }

    /// The cache store this synchronizer writes to.
    #[must_use]
    pub const fn cache(&self) -> &C {
        &self.cache
    }

    /// Project every lot into the inventory cache.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTtl`] before touching either store if
    /// `options.ttl_sec` is unusable. Otherwise returns [`SyncError`] only if
    /// the ledger cannot be read, or if cached keys cannot be listed for
    /// reconciliation. Individual document failures are counted in
    /// [`RefreshReport::failed`].
    #[tracing::instrument(skip(self), fields(reconcile = options.reconcile_deletes))]
    pub async fn refresh_inventory(&self, options: RefreshOptions) -> Result<BulkRefresh, SyncError> {
        let stamp = self.stamp(options.ttl_sec)?;
        let Ok(_permit) = self.bulk_permit.try_acquire() else {
            tracing::debug!("Bulk inventory refresh already running, skipping");
            return Ok(BulkRefresh::AlreadyRunning);
        };

        let started = Instant::now();
        let rows = self.ledger.inventory_snapshot().await?;

        let mut report = RefreshReport {
            count: rows.len(),
            ..RefreshReport::default()
        };
        let mut live_keys = HashSet::with_capacity(rows.len());

        for row in rows {
            let doc = InventoryDocument::from_row(row, stamp);
            let result = self.cache.upsert_inventory(&doc).await;
            report.record(&doc.key, result);
            live_keys.insert(doc.key);
        }

        if options.reconcile_deletes {
            let orphaned: Vec<String> = self
                .cache
                .inventory_keys()
                .await?
                .into_iter()
                .filter(|key| !live_keys.contains(key))
                .collect();

            if !orphaned.is_empty() {
                match self.cache.remove_inventory(&orphaned).await {
                    Ok(removed) => report.removed = removed,
                    Err(e) => {
                        report.failed += orphaned.len();
                        tracing::warn!(error = %e, keys = orphaned.len(), "Failed to remove orphaned documents");
                    }
                }
            }
        }

        metrics::record_cache_refresh("inventory", report.upserted, report.failed);
        metrics::record_refresh_duration(started.elapsed().as_secs_f64());
        tracing::info!(
            count = report.count,
            upserted = report.upserted,
            unchanged = report.unchanged,
            removed = report.removed,
            failed = report.failed,
            "Inventory cache refreshed"
        );

        Ok(BulkRefresh::Completed(report))
    }

    /// Project one user's bookings into the history cache.
    ///
    /// Cached bookings that no longer appear in the ledger for this user are removed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTtl`] if `ttl_sec` is unusable, or
    /// [`SyncError::Ledger`] if the ledger cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn refresh_history(&self, user_id: UserId, ttl_sec: i64) -> Result<RefreshReport, SyncError> {
        let stamp = self.stamp(ttl_sec)?;
        let bookings = self.ledger.booking_history(user_id).await?;
        let subject_key = HistoryDocument::subject_key_for(user_id);

        let mut report = RefreshReport {
            count: bookings.len(),
            ..RefreshReport::default()
        };
        let keep: Vec<BookingId> = bookings.iter().map(|b| b.booking_id).collect();

        for booking in bookings {
            let doc = HistoryDocument::from_history(user_id, booking, stamp);
            let result = self.cache.upsert_history(&doc).await;
            report.record(&format!("{}/booking:{}", doc.subject_key, doc.booking_id), result);
        }

        match self.cache.retain_history(&subject_key, &keep).await {
            Ok(removed) => report.removed = removed,
            Err(e) => tracing::warn!(subject_key = %subject_key, error = %e, "Failed to prune history documents"),
        }

        metrics::record_cache_refresh("history", report.upserted, report.failed);
        tracing::debug!(
            count = report.count,
            upserted = report.upserted,
            removed = report.removed,
            failed = report.failed,
            "History cache refreshed"
        );

        Ok(report)
    }

    fn stamp(&self, ttl_sec: i64) -> Result<CacheStamp, SyncError> {
        CacheStamp::fresh(self.clock.now(), ttl_sec).map_err(|_| SyncError::InvalidTtl(ttl_sec))
    }

    /// Cached inventory matching `filter`, soonest expiry first.
    ///
    /// Reads only the cache. Each document's `cache_status` is re-evaluated
    /// against the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cache`] if the cache cannot be read.
    pub async fn read_inventory(&self, filter: &InventoryFilter) -> Result<Vec<InventoryDocument>, SyncError> {
        let now = self.clock.now();
        let mut docs: Vec<InventoryDocument> = self
            .cache
            .load_inventory()
            .await?
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .map(|mut doc| {
                doc.stamp = doc.stamp.at(now);
                doc
            })
            .collect();
        docs.sort_by(|a, b| a.expiry_date.cmp(&b.expiry_date).then_with(|| a.key.cmp(&b.key)));
        Ok(docs)
    }

    /// A user's cached history, newest slot first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cache`] if the cache cannot be read.
    pub async fn read_history(&self, user_id: UserId) -> Result<Vec<HistoryDocument>, SyncError> {
        let now = self.clock.now();
        let mut docs: Vec<HistoryDocument> = self
            .cache
            .load_history(&HistoryDocument::subject_key_for(user_id))
            .await?
            .into_iter()
            .map(|mut doc| {
                doc.stamp = doc.stamp.at(now);
                doc
            })
            .collect();
        docs.sort_by(|a, b| {
            b.slot_start
                .cmp(&a.slot_start)
                .then_with(|| b.booking_id.cmp(&a.booking_id))
        });
        Ok(docs)
    }
}
