//! Caller-facing booking errors.
//!
//! Store errors are translated here exactly once, at the coordinator boundary.
//! Callers match on [`BookingError::kind`] to decide what to show and whether
//! to resubmit.

use pantry_core::error::LedgerError;
use pantry_core::types::{HouseholdId, LocationId, LotId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a booking failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; do not retry unchanged
    InvalidArgument,
    /// Unknown or inactive location
    NotFound,
    /// Overlapping reservation; offer another slot
    Conflict,
    /// Lost a race for stock; safe to resubmit
    InsufficientQuantity,
    /// Store failure; nothing was committed, safe to resubmit
    Unavailable,
}

impl ErrorKind {
    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InsufficientQuantity => "insufficient_quantity",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Errors returned by the booking coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// `slot_end` is not after `slot_start`.
    #[error("Invalid slot window: {0}")]
    InvalidSlot(String),

    /// No household was supplied and the user belongs to none.
    #[error("User {0} does not belong to any household")]
    NoHousehold(UserId),

    /// A requested line has a non-positive item id or quantity, or no lines were given.
    #[error("Invalid item line: {0}")]
    InvalidItem(String),

    /// The location does not exist or is not accepting bookings.
    #[error("Location {0} not found or inactive")]
    LocationNotFound(LocationId),

    /// The window overlaps an active booking of the same household at the same location.
    #[error("Household {household_id} already has an active booking overlapping this window at location {location_id}")]
    Conflict {
        /// Household holding the overlapping booking
        household_id: HouseholdId,
        /// Location of the overlapping booking
        location_id: LocationId,
    },

    /// A lot was drained by a concurrent booking after planning.
    #[error("Lot {lot_id} no longer holds {requested} units ({available} available)")]
    InsufficientQuantity {
        /// Lot that lost the race
        lot_id: LotId,
        /// Units the plan wanted
        requested: i32,
        /// Units left when the decrement ran
        available: i32,
    },

    /// The store failed; the unit of work was rolled back.
    #[error("Store error: {0}")]
    Store(String),
}

impl BookingError {
    /// The category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSlot(_) | Self::NoHousehold(_) | Self::InvalidItem(_) => {
                ErrorKind::InvalidArgument
            }
            Self::LocationNotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InsufficientQuantity { .. } => ErrorKind::InsufficientQuantity,
            Self::Store(_) => ErrorKind::Unavailable,
        }
    }

    /// Whether resubmitting the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InsufficientQuantity | ErrorKind::Unavailable
        )
    }
}

impl From<LedgerError> for BookingError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::ExclusionViolated {
                household_id,
                location_id,
            } => Self::Conflict {
                household_id,
                location_id,
            },
            LedgerError::InsufficientQuantity {
                lot_id,
                requested,
                available,
            } => Self::InsufficientQuantity {
                lot_id,
                requested,
                available,
            },
            LedgerError::InvalidArgument(msg) => Self::InvalidItem(msg),
            LedgerError::NotFound(what) => Self::Store(format!("missing row: {what}")),
            LedgerError::Storage(msg) => Self::Store(msg),
        }
    }
}
