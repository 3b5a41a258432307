//! Booking transaction coordinator.
//!
//! Turns a reservation request into a committed booking with concrete lot
//! allocations, or into nothing at all.
//!
//! # Flow
//!
//! ```text
//! validate slot ─► load location ─► resolve household ─► normalize lines
//!        │
//!        ▼  one unit of work
//! insert booking shell ─► per line: FEFO lots ─► plan ─► decrement + allocation
//!        │
//!        ▼
//!     commit   (any failure: rollback, translate error once)
//! ```
//!
//! The coordinator never writes to the read cache. Callers refresh it after
//! a successful booking if they want read-your-writes.

use crate::error::BookingError;
use crate::metrics;
use chrono::{DateTime, Utc};
use pantry_core::environment::Clock;
use pantry_core::fefo;
use pantry_core::ledger::{Ledger, LedgerUnitOfWork};
use pantry_core::types::{
    Allocation, BookingHistory, BookingId, BookingStatus, FoodItemId, HouseholdId, LocationId,
    NewBooking, Quantity, SlotWindow, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One requested line, as received from the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedItem {
    /// Catalog item
    pub food_item_id: i64,
    /// Units requested
    pub qty: i32,
}

/// A reservation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBooking {
    /// Requesting user
    pub user_id: UserId,
    /// Pickup location
    pub location_id: LocationId,
    /// Window start
    pub slot_start: DateTime<Utc>,
    /// Window end (exclusive)
    pub slot_end: DateTime<Utc>,
    /// Household to book for; defaults to the user's most recently joined household
    #[serde(default)]
    pub household_id: Option<HouseholdId>,
    /// Requested lines
    pub items: Vec<RequestedItem>,
}

/// Requested versus allocated units for one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSummary {
    /// Item
    pub food_item_id: FoodItemId,
    /// Units requested (after merging duplicate lines)
    pub requested: i32,
    /// Units actually allocated from lots
    pub allocated: i32,
}

/// Response of a committed booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    /// New booking
    pub booking_id: BookingId,
    /// Status at commit
    pub status: BookingStatus,
    /// Window start
    pub slot_start: DateTime<Utc>,
    /// Window end
    pub slot_end: DateTime<Utc>,
    /// Per-item fulfillment
    pub lines: Vec<LineSummary>,
}

impl BookingSummary {
    /// Whether every line was allocated in full.
    #[must_use]
    pub fn is_fully_allocated(&self) -> bool {
        self.lines.iter().all(|line| line.allocated == line.requested)
    }
}

/// Orchestrates booking creation against a [`Ledger`].
pub struct BookingCoordinator<L> {
    ledger: L,
    clock: Arc<dyn Clock>,
}

impl<L: Ledger> BookingCoordinator<L> {
    /// Create a coordinator.
    #[must_use]
    pub fn new(ledger: L, clock: Arc<dyn Clock>) -> Self {
        Self { ledger, clock }
    }

    /// The underlying ledger.
    #[must_use]
    pub const fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Create a booking and allocate its lines, soonest expiry first.
    ///
    /// Lines that cannot be fully covered are allocated partially (possibly
    /// not at all); the booking still commits. Compare `requested` and
    /// `allocated` in the returned lines to detect this.
    ///
    /// # Errors
    ///
    /// - [`BookingError::InvalidSlot`], [`BookingError::InvalidItem`],
    ///   [`BookingError::NoHousehold`]: rejected before touching the ledger
    /// - [`BookingError::LocationNotFound`]: unknown or inactive location
    /// - [`BookingError::Conflict`]: overlapping active booking for the household
    /// - [`BookingError::InsufficientQuantity`]: a lot was drained concurrently;
    ///   nothing was committed
    /// - [`BookingError::Store`]: store failure; nothing was committed
    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, location_id = %request.location_id)
    )]
    pub async fn create_booking(&self, request: CreateBooking) -> Result<BookingSummary, BookingError> {
        let result = self.try_create_booking(request).await;
        match &result {
            Ok(summary) => {
                metrics::record_booking_created();
                tracing::info!(
                    booking_id = %summary.booking_id,
                    lines = summary.lines.len(),
                    fully_allocated = summary.is_fully_allocated(),
                    "Booking committed"
                );
            }
            Err(err) => {
                metrics::record_booking_rejected(err.kind().as_str());
                tracing::info!(error = %err, kind = err.kind().as_str(), "Booking rejected");
            }
        }
        result
    }

    async fn try_create_booking(&self, request: CreateBooking) -> Result<BookingSummary, BookingError> {
        let slot = SlotWindow::new(request.slot_start, request.slot_end)
            .map_err(|e| BookingError::InvalidSlot(e.to_string()))?;

        let location = self
            .ledger
            .find_location(request.location_id)
            .await?
            .filter(|location| location.active)
            .ok_or(BookingError::LocationNotFound(request.location_id))?;

        let household_id = match request.household_id {
            Some(id) => id,
            None => self
                .ledger
                .latest_household(request.user_id)
                .await?
                .ok_or(BookingError::NoHousehold(request.user_id))?,
        };

        let lines = normalize_lines(&request.items)?;

        let booking = NewBooking {
            household_id,
            location_id: location.id,
            slot,
            created_at: self.clock.now(),
        };

        let mut uow = self.ledger.begin().await?;
        match allocate_lines(&mut uow, &booking, &lines).await {
            Ok(summary) => {
                uow.commit().await?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback reported an error");
                }
                Err(err)
            }
        }
    }

    /// A user's bookings across all their households, newest slot first,
    /// read from the authoritative store.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::Store`] if the ledger cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn reservation_history(&self, user_id: UserId) -> Result<Vec<BookingHistory>, BookingError> {
        Ok(self.ledger.booking_history(user_id).await?)
    }
}

/// Validate lines and merge duplicates of the same item, keeping first-seen order.
fn normalize_lines(items: &[RequestedItem]) -> Result<Vec<(FoodItemId, Quantity)>, BookingError> {
    if items.is_empty() {
        return Err(BookingError::InvalidItem(
            "at least one item line is required".to_string(),
        ));
    }

    let mut lines: Vec<(FoodItemId, Quantity)> = Vec::with_capacity(items.len());
    for item in items {
        if item.food_item_id <= 0 {
            return Err(BookingError::InvalidItem(format!(
                "food_item_id must be positive, got {}",
                item.food_item_id
            )));
        }
        let food_item_id = FoodItemId::new(item.food_item_id);
        let qty = Quantity::new(item.qty).map_err(|e| BookingError::InvalidItem(e.to_string()))?;

        if let Some((_, existing)) = lines.iter_mut().find(|(id, _)| *id == food_item_id) {
            let merged = existing.get().checked_add(qty.get()).ok_or_else(|| {
                BookingError::InvalidItem(format!("quantity overflow for item {food_item_id}"))
            })?;
            *existing = Quantity::new(merged).map_err(|e| BookingError::InvalidItem(e.to_string()))?;
        } else {
            lines.push((food_item_id, qty));
        }
    }
    Ok(lines)
}

/// Indices of `lines` in ascending item id order.
///
/// Decrements lock lot rows until commit. Taking every booking's locks in one
/// global order (item id, then FEFO within the item) means two bookings asking
/// for the same items in different orders cannot deadlock.
fn lock_order(lines: &[(FoodItemId, Quantity)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..lines.len()).collect();
    order.sort_by_key(|&i| lines[i].0);
    order
}

/// The transactional body. Any error leaves the unit of work for the caller to roll back.
///
/// Lines are processed in [`lock_order`]; the summary keeps request order.
async fn allocate_lines<U: LedgerUnitOfWork>(
    uow: &mut U,
    booking: &NewBooking,
    lines: &[(FoodItemId, Quantity)],
) -> Result<BookingSummary, BookingError> {
    let booking_id = uow.insert_booking(booking).await?;
    tracing::debug!(booking_id = %booking_id, "Booking shell inserted");

    let mut allocated = vec![0; lines.len()];
    for index in lock_order(lines) {
        let (food_item_id, requested) = lines[index];
        let lots = uow.fefo_lots(booking.location_id, food_item_id).await?;
        let plan = fefo::allocate(food_item_id, requested, &lots);

        for step in &plan.steps {
            uow.decrement(step.lot_id, step.qty_taken).await?;
            metrics::record_lot_decremented(step.qty_taken.get());

            let allocation = Allocation::new(booking_id, step.lot_id, food_item_id, step.qty_taken, 0)?;
            uow.insert_allocation(&allocation).await?;
        }

        if !plan.is_fully_satisfied() {
            tracing::debug!(
                food_item_id = %food_item_id,
                requested = requested.get(),
                shortfall = plan.shortfall(),
                "Line partially allocated"
            );
        }

        allocated[index] = plan.allocated();
    }

    let summaries = lines
        .iter()
        .zip(allocated)
        .map(|(&(food_item_id, requested), allocated)| LineSummary {
            food_item_id,
            requested: requested.get(),
            allocated,
        })
        .collect();

    Ok(BookingSummary {
        booking_id,
        status: BookingStatus::Pending,
        slot_start: booking.slot.start(),
        slot_end: booking.slot.end(),
        lines: summaries,
    })
}
