//! In-memory ledger with real unit-of-work semantics.
//!
//! Mirrors what the Postgres ledger guarantees so coordinator tests exercise
//! the same contract:
//!
//! - decrements are conditional and applied immediately under the state lock,
//!   so concurrent units of work can never drive a lot below zero
//! - a booking shell claims its slot at insert time; an overlapping active
//!   claim from any unit of work (committed or not) is rejected
//! - bookings and allocation rows only become visible on commit
//! - rollback, or dropping an unfinished unit of work, restores every
//!   decrement and withdraws the claim

use crate::lock;
use chrono::{DateTime, Utc};
use pantry_core::error::LedgerError;
use pantry_core::ledger::{Ledger, LedgerUnitOfWork};
use pantry_core::types::{
    Allocation, Booking, BookingHistory, BookingId, BookingStatus, FoodItem, FoodItemId,
    HistoryLine, HouseholdId, InventoryRow, Location, LocationId, Lot, LotId, NewBooking,
    Quantity, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Membership {
    user_id: UserId,
    household_id: HouseholdId,
    joined_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    locations: HashMap<LocationId, Location>,
    items: HashMap<FoodItemId, FoodItem>,
    memberships: Vec<Membership>,
    lots: BTreeMap<LotId, Lot>,
    bookings: BTreeMap<BookingId, Booking>,
    /// Shells inserted by units of work that have not finished yet
    claims: BTreeMap<BookingId, Booking>,
    allocations: Vec<Allocation>,
    next_booking_id: i64,
    unavailable: bool,
    fail_next_commit: bool,
    /// Simulated concurrent drain applied right after the next FEFO read
    drain_after_read: Option<(LotId, i32)>,
}

impl LedgerState {
    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable {
            Err(LedgerError::Storage("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn overlapping(&self, booking: &NewBooking) -> bool {
        self.bookings
            .values()
            .chain(self.claims.values())
            .any(|existing| {
                existing.status.is_active()
                    && existing.household_id == booking.household_id
                    && existing.location_id == booking.location_id
                    && existing.slot.overlaps(&booking.slot)
            })
    }
}

/// In-memory authoritative store.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a location.
    pub fn add_location(&self, location: Location) {
        lock(&self.state).locations.insert(location.id, location);
    }

    /// Activate or deactivate a location.
    pub fn set_location_active(&self, location_id: LocationId, active: bool) {
        if let Some(location) = lock(&self.state).locations.get_mut(&location_id) {
            location.active = active;
        }
    }

    /// Register a catalog item.
    pub fn add_food_item(&self, item: FoodItem) {
        lock(&self.state).items.insert(item.id, item);
    }

    /// Record that `user_id` joined `household_id` at `joined_at`.
    pub fn add_member(&self, user_id: UserId, household_id: HouseholdId, joined_at: DateTime<Utc>) {
        lock(&self.state).memberships.push(Membership {
            user_id,
            household_id,
            joined_at,
        });
    }

    /// Register a lot (donation intake).
    pub fn add_lot(&self, lot: Lot) {
        lock(&self.state).lots.insert(lot.lot_id, lot);
    }

    /// Current committed state of a lot.
    #[must_use]
    pub fn lot(&self, lot_id: LotId) -> Option<Lot> {
        lock(&self.state).lots.get(&lot_id).cloned()
    }

    /// Committed bookings, by id.
    #[must_use]
    pub fn bookings(&self) -> Vec<Booking> {
        lock(&self.state).bookings.values().cloned().collect()
    }

    /// Committed allocation rows of a booking, in insertion order.
    #[must_use]
    pub fn allocations_for(&self, booking_id: BookingId) -> Vec<Allocation> {
        lock(&self.state)
            .allocations
            .iter()
            .filter(|a| a.booking_id == booking_id)
            .cloned()
            .collect()
    }

    /// Number of unit-of-work claims still open.
    #[must_use]
    pub fn open_claims(&self) -> usize {
        lock(&self.state).claims.len()
    }

    /// Administrative status change.
    pub fn set_booking_status(&self, booking_id: BookingId, status: BookingStatus) {
        if let Some(booking) = lock(&self.state).bookings.get_mut(&booking_id) {
            booking.status = status;
        }
    }

    /// Make every read and `begin` fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    /// Make the next commit fail with a storage error (connection lost mid-commit).
    pub fn fail_next_commit(&self) {
        lock(&self.state).fail_next_commit = true;
    }

    /// Take `qty` units out of `lot_id` right after the next FEFO read, as a
    /// concurrent booking would between planning and decrement.
    pub fn drain_after_next_read(&self, lot_id: LotId, qty: i32) {
        lock(&self.state).drain_after_read = Some((lot_id, qty));
    }
}

impl Ledger for InMemoryLedger {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::UnitOfWork, LedgerError> {
        lock(&self.state).check_available()?;
        Ok(InMemoryUnitOfWork {
            state: Arc::clone(&self.state),
            claims: Vec::new(),
            decrements: Vec::new(),
            allocations: Vec::new(),
            finished: false,
        })
    }

    async fn find_location(&self, location_id: LocationId) -> Result<Option<Location>, LedgerError> {
        let state = lock(&self.state);
        state.check_available()?;
        Ok(state.locations.get(&location_id).cloned())
    }

    async fn latest_household(&self, user_id: UserId) -> Result<Option<HouseholdId>, LedgerError> {
        let state = lock(&self.state);
        state.check_available()?;
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .max_by_key(|m| (m.joined_at, m.household_id))
            .map(|m| m.household_id))
    }

    async fn booking_history(&self, user_id: UserId) -> Result<Vec<BookingHistory>, LedgerError> {
        let state = lock(&self.state);
        state.check_available()?;

        let households: Vec<HouseholdId> = state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.household_id)
            .collect();

        let mut history: Vec<BookingHistory> = state
            .bookings
            .values()
            .filter(|b| households.contains(&b.household_id))
            .map(|booking| {
                let mut lines: Vec<HistoryLine> = Vec::new();
                for allocation in state
                    .allocations
                    .iter()
                    .filter(|a| a.booking_id == booking.booking_id)
                {
                    if let Some(line) = lines.iter_mut().find(|l| l.item_id == allocation.food_item_id) {
                        line.qty_allocated += allocation.qty_allocated().get();
                        line.qty_collected += allocation.qty_collected();
                    } else {
                        let item = state.items.get(&allocation.food_item_id);
                        lines.push(HistoryLine {
                            item_id: allocation.food_item_id,
                            name: item.map(|i| i.name.clone()).unwrap_or_default(),
                            unit: item.map(|i| i.unit.clone()).unwrap_or_default(),
                            qty_allocated: allocation.qty_allocated().get(),
                            qty_collected: allocation.qty_collected(),
                        });
                    }
                }
                lines.sort_by_key(|l| l.item_id);

                BookingHistory {
                    booking_id: booking.booking_id,
                    location_id: booking.location_id,
                    location_name: state
                        .locations
                        .get(&booking.location_id)
                        .map(|l| l.name.clone())
                        .unwrap_or_default(),
                    slot: booking.slot,
                    status: booking.status,
                    created_at: booking.created_at,
                    items: lines,
                }
            })
            .collect();

        history.sort_by(|a, b| {
            b.slot
                .start()
                .cmp(&a.slot.start())
                .then(b.booking_id.cmp(&a.booking_id))
        });
        Ok(history)
    }

    async fn inventory_snapshot(&self) -> Result<Vec<InventoryRow>, LedgerError> {
        let state = lock(&self.state);
        state.check_available()?;

        Ok(state
            .lots
            .values()
            .filter_map(|lot| {
                let item = state.items.get(&lot.food_item_id)?;
                let location = state.locations.get(&lot.location_id).filter(|l| l.active)?;
                Some(InventoryRow {
                    lot_id: lot.lot_id,
                    food_item_id: item.id,
                    item_name: item.name.clone(),
                    category: item.category.clone(),
                    unit: item.unit.clone(),
                    qty_on_hand: lot.quantity_on_hand(),
                    location_id: location.id,
                    location_name: location.name.clone(),
                    expiry_date: lot.expiry_date,
                    diets: item.diets.clone(),
                })
            })
            .collect())
    }
}

/// One unit of work against an [`InMemoryLedger`].
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    state: Arc<Mutex<LedgerState>>,
    claims: Vec<BookingId>,
    decrements: Vec<(LotId, Quantity)>,
    allocations: Vec<Allocation>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    fn undo(&mut self) {
        let mut state = lock(&self.state);
        for booking_id in self.claims.drain(..) {
            state.claims.remove(&booking_id);
        }
        for (lot_id, qty) in self.decrements.drain(..).rev() {
            if let Some(lot) = state.lots.get_mut(&lot_id) {
                // Restoring units cannot violate the non-negative invariant.
                if let Ok(restored) = Lot::new(
                    lot.lot_id,
                    lot.food_item_id,
                    lot.location_id,
                    lot.quantity_on_hand() + qty.get(),
                    lot.expiry_date,
                ) {
                    *lot = restored;
                }
            }
        }
        self.allocations.clear();
        self.finished = true;
    }
}

impl LedgerUnitOfWork for InMemoryUnitOfWork {
    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, LedgerError> {
        let mut state = lock(&self.state);
        state.check_available()?;

        if state.overlapping(booking) {
            return Err(LedgerError::ExclusionViolated {
                household_id: booking.household_id,
                location_id: booking.location_id,
            });
        }

        state.next_booking_id += 1;
        let booking_id = BookingId::new(state.next_booking_id);
        state.claims.insert(
            booking_id,
            Booking {
                booking_id,
                household_id: booking.household_id,
                location_id: booking.location_id,
                slot: booking.slot,
                status: BookingStatus::Pending,
                created_at: booking.created_at,
            },
        );
        self.claims.push(booking_id);
        Ok(booking_id)
    }

    async fn fefo_lots(
        &mut self,
        location_id: LocationId,
        food_item_id: FoodItemId,
    ) -> Result<Vec<Lot>, LedgerError> {
        let mut state = lock(&self.state);
        state.check_available()?;

        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|lot| {
                lot.location_id == location_id
                    && lot.food_item_id == food_item_id
                    && lot.quantity_on_hand() > 0
            })
            .cloned()
            .collect();
        lots.sort_by_key(Lot::fefo_key);

        if let Some((lot_id, qty)) = state.drain_after_read.take() {
            if let (Some(lot), Ok(qty)) = (state.lots.get_mut(&lot_id), Quantity::new(qty)) {
                let _ = lot.take(qty);
            }
        }

        Ok(lots)
    }

    async fn decrement(&mut self, lot_id: LotId, qty: Quantity) -> Result<(), LedgerError> {
        let mut state = lock(&self.state);
        state.check_available()?;

        let lot = state
            .lots
            .get_mut(&lot_id)
            .ok_or_else(|| LedgerError::NotFound(format!("lot {lot_id}")))?;
        lot.take(qty)?;
        self.decrements.push((lot_id, qty));
        Ok(())
    }

    async fn insert_allocation(&mut self, allocation: &Allocation) -> Result<(), LedgerError> {
        let state = lock(&self.state);
        state.check_available()?;

        if !self.claims.contains(&allocation.booking_id) {
            return Err(LedgerError::Storage(format!(
                "allocation references unknown booking {}",
                allocation.booking_id
            )));
        }
        self.allocations.push(allocation.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), LedgerError> {
        let failed = {
            let mut state = lock(&self.state);
            std::mem::take(&mut state.fail_next_commit) || state.unavailable
        };
        if failed {
            self.undo();
            return Err(LedgerError::Storage("connection lost during commit".to_string()));
        }

        let mut state = lock(&self.state);
        for booking_id in self.claims.drain(..) {
            if let Some(booking) = state.claims.remove(&booking_id) {
                state.bookings.insert(booking_id, booking);
            }
        }
        state.allocations.append(&mut self.allocations);
        self.decrements.clear();
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), LedgerError> {
        self.undo();
        Ok(())
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures::{at, date, location, lot, qty, slot};

    fn new_booking(household: i64, from: i64, to: i64) -> NewBooking {
        let day = at(2024, 1, 10, 0);
        NewBooking {
            household_id: HouseholdId::new(household),
            location_id: LocationId::new(1),
            slot: slot(day, from, to),
            created_at: day,
        }
    }

    #[tokio::test]
    async fn test_decrement_is_conditional() {
        let ledger = InMemoryLedger::new();
        ledger.add_lot(lot(1, 1, 1, 5, date(2024, 1, 1)));

        let mut uow = ledger.begin().await.unwrap();
        uow.decrement(LotId::new(1), qty(3)).await.unwrap();
        let err = uow.decrement(LotId::new(1), qty(3)).await.unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientQuantity { available: 2, .. }));
        uow.commit().await.unwrap();
        assert_eq!(ledger.lot(LotId::new(1)).unwrap().quantity_on_hand(), 2);
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let ledger = InMemoryLedger::new();
        ledger.add_location(location(1, "Main St"));
        ledger.add_lot(lot(1, 1, 1, 5, date(2024, 1, 1)));

        {
            let mut uow = ledger.begin().await.unwrap();
            uow.insert_booking(&new_booking(1, 9, 10)).await.unwrap();
            uow.decrement(LotId::new(1), qty(5)).await.unwrap();
        }

        assert_eq!(ledger.lot(LotId::new(1)).unwrap().quantity_on_hand(), 5);
        assert!(ledger.bookings().is_empty());
        assert_eq!(ledger.open_claims(), 0);
    }

    #[tokio::test]
    async fn test_uncommitted_claim_excludes_overlap() {
        let ledger = InMemoryLedger::new();

        let mut first = ledger.begin().await.unwrap();
        first.insert_booking(&new_booking(1, 9, 11)).await.unwrap();

        let mut second = ledger.begin().await.unwrap();
        let err = second.insert_booking(&new_booking(1, 10, 12)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ExclusionViolated { .. }));

        // A different household is not affected.
        second.insert_booking(&new_booking(2, 10, 12)).await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_bookings_do_not_exclude() {
        let ledger = InMemoryLedger::new();

        let mut uow = ledger.begin().await.unwrap();
        let id = uow.insert_booking(&new_booking(1, 9, 11)).await.unwrap();
        uow.commit().await.unwrap();
        ledger.set_booking_status(id, BookingStatus::Cancelled);

        let mut uow = ledger.begin().await.unwrap();
        assert!(uow.insert_booking(&new_booking(1, 9, 11)).await.is_ok());
    }
}
