//! Store-level error kinds.
//!
//! Ledger and cache backends report failures through these enums. Backend
//! specific codes (SQLSTATE, Redis replies) are mapped here once, inside the
//! backend, and translated to caller-facing categories by the coordinator.

use crate::types::{HouseholdId, LocationId, LotId};
use thiserror::Error;

/// Errors raised by the authoritative store (ledger, bookings, allocations).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A value failed validation before reaching the store.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced row does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional decrement found fewer units than requested.
    #[error("Insufficient quantity in lot {lot_id}: requested {requested}, available {available}")]
    InsufficientQuantity {
        /// The lot that lost the race
        lot_id: LotId,
        /// Units requested
        requested: i32,
        /// Units on hand at the time of the attempt
        available: i32,
    },

    /// The booking overlaps an active booking of the same household at the same location.
    #[error("Booking window overlaps an active booking for household {household_id} at location {location_id}")]
    ExclusionViolated {
        /// Household holding the conflicting booking
        household_id: HouseholdId,
        /// Location of the conflicting booking
        location_id: LocationId,
    },

    /// Connection loss, unexpected constraint, decode failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Errors raised by the read-side cache store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Storage backend error
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// Document (de)serialization error
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// A TTL that is not positive or overflows the timestamp range
    #[error("Invalid cache TTL: {0} seconds")]
    InvalidTtl(i64),
}

/// Errors raised by idempotency replay stores and rate limiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateStoreError {
    /// Storage backend error
    #[error("Gate storage error: {0}")]
    Storage(String),

    /// Stored record could not be (de)serialized
    #[error("Gate serialization error: {0}")]
    Serialization(String),
}
