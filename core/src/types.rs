//! Domain types for the pantry booking engine.
//!
//! Identifiers, value objects and the authoritative records (lots, bookings,
//! allocations). Invariants are checked in constructors so a value that exists
//! is a value that is valid.

use crate::error::LedgerError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database identifier.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw identifier.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of an authenticated user
    UserId
);
id_type!(
    /// Identifier of a household (the group that owns bookings)
    HouseholdId
);
id_type!(
    /// Identifier of a pickup location
    LocationId
);
id_type!(
    /// Identifier of a catalog food item
    FoodItemId
);
id_type!(
    /// Identifier of a physical inventory lot
    LotId
);
id_type!(
    /// Identifier of a booking (reservation)
    BookingId
);

// ============================================================================
// Value Objects
// ============================================================================

/// A strictly positive quantity of units.
///
/// Every decrement and every requested line goes through this type, so a zero
/// or negative amount can never reach the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Quantity(i32);

impl Quantity {
    /// Create a quantity.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `value <= 0`.
    pub fn new(value: i32) -> Result<Self, LedgerError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidArgument(format!(
                "quantity must be a positive integer, got {value}"
            )))
        }
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(&self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for Quantity {
    type Error = LedgerError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for i32 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pickup time window `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SlotWindowRaw")]
pub struct SlotWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Unvalidated wire shape of [`SlotWindow`].
#[derive(Deserialize)]
struct SlotWindowRaw {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<SlotWindowRaw> for SlotWindow {
    type Error = LedgerError;

    fn try_from(raw: SlotWindowRaw) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl SlotWindow {
    /// Create a slot window.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] unless `end > start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, LedgerError> {
        if end > start {
            Ok(Self { start, end })
        } else {
            Err(LedgerError::InvalidArgument(format!(
                "slot_end ({end}) must be after slot_start ({start})"
            )))
        }
    }

    /// Start of the window (inclusive).
    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// End of the window (exclusive).
    #[must_use]
    pub const fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Half-open interval overlap: touching windows do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// A pickup site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Location ID
    pub id: LocationId,
    /// Display name
    pub name: String,
    /// Inactive locations do not accept bookings
    pub active: bool,
}

/// A catalog entry. Identity is fixed once lots or bookings reference it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodItem {
    /// Item ID
    pub id: FoodItemId,
    /// Display name
    pub name: String,
    /// Category name
    pub category: String,
    /// Unit of measure (e.g. "kg", "can")
    pub unit: String,
    /// Diet tags (e.g. "vegan", "halal")
    pub diets: Vec<String>,
}

// ============================================================================
// Lots
// ============================================================================

/// A physical quantity of one item at one location sharing one expiry date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LotRaw")]
pub struct Lot {
    /// Lot ID
    pub lot_id: LotId,
    /// Item held in this lot
    pub food_item_id: FoodItemId,
    /// Location holding this lot
    pub location_id: LocationId,
    quantity_on_hand: i32,
    /// Expiry date
    pub expiry_date: NaiveDate,
}

#[derive(Deserialize)]
struct LotRaw {
    lot_id: LotId,
    food_item_id: FoodItemId,
    location_id: LocationId,
    quantity_on_hand: i32,
    expiry_date: NaiveDate,
}

impl TryFrom<LotRaw> for Lot {
    type Error = LedgerError;

    fn try_from(raw: LotRaw) -> Result<Self, Self::Error> {
        Self::new(
            raw.lot_id,
            raw.food_item_id,
            raw.location_id,
            raw.quantity_on_hand,
            raw.expiry_date,
        )
    }
}

impl Lot {
    /// Create a lot.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `quantity_on_hand` is negative.
    pub fn new(
        lot_id: LotId,
        food_item_id: FoodItemId,
        location_id: LocationId,
        quantity_on_hand: i32,
        expiry_date: NaiveDate,
    ) -> Result<Self, LedgerError> {
        if quantity_on_hand < 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "lot {lot_id} quantity_on_hand cannot be negative ({quantity_on_hand})"
            )));
        }
        Ok(Self {
            lot_id,
            food_item_id,
            location_id,
            quantity_on_hand,
            expiry_date,
        })
    }

    /// Units currently on hand (never negative).
    #[must_use]
    pub const fn quantity_on_hand(&self) -> i32 {
        self.quantity_on_hand
    }

    /// Take `qty` units out of this lot.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientQuantity`] if fewer than `qty` units are on hand;
    /// the lot is left untouched in that case.
    pub fn take(&mut self, qty: Quantity) -> Result<(), LedgerError> {
        if self.quantity_on_hand < qty.get() {
            return Err(LedgerError::InsufficientQuantity {
                lot_id: self.lot_id,
                requested: qty.get(),
                available: self.quantity_on_hand,
            });
        }
        self.quantity_on_hand -= qty.get();
        Ok(())
    }

    /// FEFO sort key: soonest expiry first, then lowest lot id.
    #[must_use]
    pub const fn fefo_key(&self) -> (NaiveDate, LotId) {
        (self.expiry_date, self.lot_id)
    }
}

// ============================================================================
// Bookings
// ============================================================================

/// Booking lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    /// Created by the engine, awaiting administrative action
    Pending,
    /// Confirmed by an administrator
    Confirmed,
    /// Cancelled
    Cancelled,
    /// Picked up
    Completed,
}

impl BookingStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Parse the database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] for an unknown status string.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            other => Err(LedgerError::Storage(format!("invalid booking status: {other}"))),
        }
    }

    /// Whether a booking in this status holds its slot for overlap checks.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    /// Whether an administrator may move a booking from `self` to `next`.
    ///
    /// The allocation engine never changes status; this only validates
    /// transitions requested elsewhere.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed | Self::Cancelled | Self::Completed)
                | (Self::Confirmed, Self::Cancelled | Self::Completed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The booking shell inserted at the start of a booking unit of work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBooking {
    /// Owning household
    pub household_id: HouseholdId,
    /// Pickup location
    pub location_id: LocationId,
    /// Pickup window
    pub slot: SlotWindow,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A committed booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking ID
    pub booking_id: BookingId,
    /// Owning household
    pub household_id: HouseholdId,
    /// Pickup location
    pub location_id: LocationId,
    /// Pickup window
    pub slot: SlotWindow,
    /// Current status
    pub status: BookingStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// One lot drawn against one booking line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AllocationRaw")]
pub struct Allocation {
    /// Booking the allocation belongs to
    pub booking_id: BookingId,
    /// Lot the units were taken from
    pub lot_id: LotId,
    /// Item allocated
    pub food_item_id: FoodItemId,
    qty_allocated: Quantity,
    qty_collected: i32,
}

#[derive(Deserialize)]
struct AllocationRaw {
    booking_id: BookingId,
    lot_id: LotId,
    food_item_id: FoodItemId,
    qty_allocated: Quantity,
    qty_collected: i32,
}

impl TryFrom<AllocationRaw> for Allocation {
    type Error = LedgerError;

    fn try_from(raw: AllocationRaw) -> Result<Self, Self::Error> {
        Self::new(
            raw.booking_id,
            raw.lot_id,
            raw.food_item_id,
            raw.qty_allocated,
            raw.qty_collected,
        )
    }
}

impl Allocation {
    /// Create an allocation row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `qty_collected` is negative or
    /// exceeds `qty_allocated`.
    pub fn new(
        booking_id: BookingId,
        lot_id: LotId,
        food_item_id: FoodItemId,
        qty_allocated: Quantity,
        qty_collected: i32,
    ) -> Result<Self, LedgerError> {
        if qty_collected < 0 || qty_collected > qty_allocated.get() {
            return Err(LedgerError::InvalidArgument(format!(
                "qty_collected {qty_collected} must be within 0..={qty_allocated}"
            )));
        }
        Ok(Self {
            booking_id,
            lot_id,
            food_item_id,
            qty_allocated,
            qty_collected,
        })
    }

    /// Units allocated from the lot.
    #[must_use]
    pub const fn qty_allocated(&self) -> Quantity {
        self.qty_allocated
    }

    /// Units collected at pickup (0 until pickup is confirmed).
    #[must_use]
    pub const fn qty_collected(&self) -> i32 {
        self.qty_collected
    }
}

// ============================================================================
// Read models sourced from the authoritative store
// ============================================================================

/// One line of a booking as shown in history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLine {
    /// Item ID
    pub item_id: FoodItemId,
    /// Item name
    pub name: String,
    /// Unit of measure
    pub unit: String,
    /// Units allocated across all lots
    pub qty_allocated: i32,
    /// Units collected across all lots
    pub qty_collected: i32,
}

/// A booking with its line items, as read from the authoritative store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingHistory {
    /// Booking ID
    pub booking_id: BookingId,
    /// Location ID
    pub location_id: LocationId,
    /// Location name
    pub location_name: String,
    /// Pickup window
    pub slot: SlotWindow,
    /// Current status
    pub status: BookingStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Line items, one per food item
    pub items: Vec<HistoryLine>,
}

/// One lot joined with its catalog and location data, as read for cache refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRow {
    /// Lot ID
    pub lot_id: LotId,
    /// Item ID
    pub food_item_id: FoodItemId,
    /// Item name
    pub item_name: String,
    /// Category name
    pub category: String,
    /// Unit of measure
    pub unit: String,
    /// Units on hand
    pub qty_on_hand: i32,
    /// Location ID
    pub location_id: LocationId,
    /// Location name
    pub location_name: String,
    /// Expiry date
    pub expiry_date: NaiveDate,
    /// Diet tags of the item
    pub diets: Vec<String>,
}
