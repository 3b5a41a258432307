//! Authoritative store abstraction: lots, bookings and allocations.
//!
//! # Design
//!
//! The [`Ledger`] gives out units of work. Everything that must commit or
//! roll back together (booking shell, decrements, allocation rows) goes
//! through one [`LedgerUnitOfWork`]; plain reads used before or after a
//! booking go through the ledger itself.
//!
//! Two guarantees are pushed down to the store rather than checked by callers:
//!
//! - [`LedgerUnitOfWork::decrement`] is an atomic conditional decrement. Two
//!   concurrent decrements on the same lot can never both take it below zero.
//! - [`LedgerUnitOfWork::insert_booking`] enforces the overlap exclusion for
//!   active bookings of the same household at the same location, reporting
//!   [`LedgerError::ExclusionViolated`]. There is no separate check-then-insert.
//!
//! # Implementations
//!
//! - `PostgresLedger` (in `pantry-postgres`): production
//! - `InMemoryLedger` (in `pantry-testing`): fast, deterministic tests
//!
//! A unit of work that is dropped without [`LedgerUnitOfWork::commit`] rolls
//! back.

use crate::error::LedgerError;
use crate::types::{
    Allocation, BookingHistory, BookingId, FoodItemId, HouseholdId, InventoryRow, Location,
    LocationId, Lot, LotId, NewBooking, Quantity, UserId,
};
use std::future::Future;

/// Authoritative relational store.
pub trait Ledger: Send + Sync {
    /// The unit-of-work type handed out by [`Ledger::begin`].
    type UnitOfWork: LedgerUnitOfWork;

    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the store cannot be reached.
    fn begin(&self) -> impl Future<Output = Result<Self::UnitOfWork, LedgerError>> + Send;

    /// Look up a location.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the query fails.
    fn find_location(
        &self,
        location_id: LocationId,
    ) -> impl Future<Output = Result<Option<Location>, LedgerError>> + Send;

    /// The household the user joined most recently, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the query fails.
    fn latest_household(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Option<HouseholdId>, LedgerError>> + Send;

    /// All bookings of every household the user belongs to, newest slot first,
    /// with one line per food item.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the query fails.
    fn booking_history(
        &self,
        user_id: UserId,
    ) -> impl Future<Output = Result<Vec<BookingHistory>, LedgerError>> + Send;

    /// Every lot joined with its item and location, for cache refresh.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the query fails.
    fn inventory_snapshot(
        &self,
    ) -> impl Future<Output = Result<Vec<InventoryRow>, LedgerError>> + Send;
}

/// One atomic, all-or-nothing unit of work against the ledger.
pub trait LedgerUnitOfWork: Send {
    /// Insert a booking shell in `pending` status.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ExclusionViolated`] if the window overlaps an active
    ///   booking of the same household at the same location
    /// - [`LedgerError::Storage`] on any other store failure
    fn insert_booking(
        &mut self,
        booking: &NewBooking,
    ) -> impl Future<Output = Result<BookingId, LedgerError>> + Send;

    /// Lots of an item at a location with stock on hand, soonest expiry first,
    /// ties broken by ascending lot id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the query fails.
    fn fefo_lots(
        &mut self,
        location_id: LocationId,
        food_item_id: FoodItemId,
    ) -> impl Future<Output = Result<Vec<Lot>, LedgerError>> + Send;

    /// Atomically take `qty` units from a lot, only if that many are on hand.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientQuantity`] if fewer than `qty` units remain
    /// - [`LedgerError::NotFound`] if the lot does not exist
    /// - [`LedgerError::Storage`] on any other store failure
    fn decrement(
        &mut self,
        lot_id: LotId,
        qty: Quantity,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Persist an allocation row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the insert fails.
    fn insert_allocation(
        &mut self,
        allocation: &Allocation,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Make every write of this unit of work visible.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ExclusionViolated`] for a deferred overlap check,
    /// or [`LedgerError::Storage`] if the commit fails. Nothing is kept on error.
    fn commit(self) -> impl Future<Output = Result<(), LedgerError>> + Send;

    /// Discard every write of this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the store reports a failure while
    /// rolling back. The writes are discarded regardless.
    fn rollback(self) -> impl Future<Output = Result<(), LedgerError>> + Send;
}
