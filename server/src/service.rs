//! The booking entry points exposed to collaborators.
//!
//! [`BookingService`] wires the pieces together in request order:
//!
//! ```text
//! replay lookup ─► rate limiter ─► idempotency gate ─► coordinator ─► commit ─► history refresh
//! ```
//!
//! A retry whose key already has a stored response is answered from the
//! replay store before the rate limiter, so replays never use up budget.
//!
//! The history refresh after a booking is best effort. The booking is already
//! committed by then, so a cache failure is logged and never changes the response.

use crate::coordinator::{BookingCoordinator, BookingSummary, CreateBooking};
use crate::error::BookingError;
use crate::gate::{GateError, GateOutcome, IdempotencyGate};
use crate::sync::{CacheSynchronizer, SyncError};
use pantry_core::cache::{CacheStore, HistoryDocument};
use pantry_core::gate::{RateDecision, RateLimiter, ReplayStore};
use pantry_core::ledger::Ledger;
use pantry_core::types::{BookingHistory, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Tunables for [`BookingService`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    /// How long completed responses are replayed
    pub idempotency_ttl: Duration,
    /// Requests allowed per user per window
    pub rate_limit_requests: u32,
    /// Rate-limit window
    pub rate_limit_window: Duration,
    /// TTL stamped on history documents, in seconds
    pub history_ttl_sec: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(86_400),
            rate_limit_requests: 10,
            rate_limit_window: Duration::from_secs(60),
            history_ttl_sec: 120,
        }
    }
}

/// Booking entry points guarded by rate limiting and idempotency.
pub struct BookingService<L, C, R, RL> {
    coordinator: BookingCoordinator<L>,
    synchronizer: Arc<CacheSynchronizer<L, C>>,
    gate: IdempotencyGate<R>,
    limiter: RL,
    settings: ServiceSettings,
}

impl<L, C, R, RL> BookingService<L, C, R, RL>
where
    L: Ledger,
    C: CacheStore,
    R: ReplayStore,
    RL: RateLimiter,
{
    /// Assemble a service from its parts.
    #[must_use]
    pub const fn new(
        coordinator: BookingCoordinator<L>,
        synchronizer: Arc<CacheSynchronizer<L, C>>,
        gate: IdempotencyGate<R>,
        limiter: RL,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            coordinator,
            synchronizer,
            gate,
            limiter,
            settings,
        }
    }

    /// The synchronizer shared with the refresh scheduler.
    #[must_use]
    pub const fn synchronizer(&self) -> &Arc<CacheSynchronizer<L, C>> {
        &self.synchronizer
    }

    /// `CreateReservation`.
    ///
    /// With an idempotency key, a repeat of a completed call returns the first
    /// response unchanged and creates nothing. Without one, every call runs.
    ///
    /// # Errors
    ///
    /// - [`GateError::RateLimited`] if the user is over budget
    /// - [`GateError::InvalidKey`] / [`GateError::InProgress`] from the gate
    /// - [`GateError::Store`] if the limiter or replay store is unreachable
    /// - [`GateError::Operation`] with the [`BookingError`] otherwise
    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_reservation(
        &self,
        request: CreateBooking,
        idempotency_key: Option<&str>,
    ) -> Result<GateOutcome<BookingSummary>, GateError<BookingError>> {
        let identity = format!("user:{}", request.user_id);

        if let Some(key) = idempotency_key {
            if let Some(response) = self.gate.replay::<_, BookingError>(&identity, key).await? {
                return Ok(GateOutcome::Replayed(response));
            }
        }

        let decision = self
            .limiter
            .check_and_record(
                &identity,
                self.settings.rate_limit_requests,
                self.settings.rate_limit_window,
            )
            .await?;
        if let RateDecision::Limited { retry_after } = decision {
            return Err(GateError::RateLimited { retry_after });
        }

        match idempotency_key {
            Some(key) => {
                self.gate
                    .execute(&identity, key, self.settings.idempotency_ttl, || self.book(request))
                    .await
            }
            None => self
                .book(request)
                .await
                .map(GateOutcome::Executed)
                .map_err(GateError::Operation),
        }
    }

    async fn book(&self, request: CreateBooking) -> Result<BookingSummary, BookingError> {
        let user_id = request.user_id;
        let summary = self.coordinator.create_booking(request).await?;

        if let Err(e) = self
            .synchronizer
            .refresh_history(user_id, self.settings.history_ttl_sec)
            .await
        {
            tracing::warn!(error = %e, "History cache refresh after booking failed");
        }
        Ok(summary)
    }

    /// `GetReservationHistory` from the authoritative store.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] if the ledger cannot be read.
    pub async fn reservation_history(&self, user_id: UserId) -> Result<Vec<BookingHistory>, BookingError> {
        self.coordinator.reservation_history(user_id).await
    }

    /// A user's history from the read cache, refreshed on demand first.
    ///
    /// If the refresh cannot reach the ledger, whatever is cached is returned
    /// with its (possibly stale) status.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cache`] if the cache cannot be read.
    pub async fn cached_history(&self, user_id: UserId) -> Result<Vec<HistoryDocument>, SyncError> {
        if let Err(e) = self
            .synchronizer
            .refresh_history(user_id, self.settings.history_ttl_sec)
            .await
        {
            tracing::warn!(error = %e, "On-demand history refresh failed, serving cached documents");
        }
        self.synchronizer.read_history(user_id).await
    }
}
