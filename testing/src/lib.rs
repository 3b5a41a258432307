//! # Pantry Testing
//!
//! Testing utilities for the pantry booking engine.
//!
//! This crate provides:
//! - [`InMemoryLedger`]: authoritative store with real unit-of-work semantics
//!   (atomic conditional decrements, overlap exclusion, rollback on drop)
//! - [`InMemoryCacheStore`]: read-side document store with failure injection
//! - [`InMemoryReplayStore`] and [`InMemoryRateLimiter`]: gate storage
//! - [`mocks::FixedClock`] and [`mocks::ManualClock`]: deterministic time
//! - [`fixtures`]: small builders for lots, items and dates
//!
//! ## Example
//!
//! ```ignore
//! use pantry_testing::{fixtures, InMemoryLedger};
//!
//! #[tokio::test]
//! async fn test_fefo_booking() {
//!     let ledger = InMemoryLedger::new();
//!     ledger.add_location(fixtures::location(1, "Main St"));
//!     ledger.add_lot(fixtures::lot(1, 7, 1, 5, fixtures::date(2024, 1, 1)));
//!     // ... run the coordinator against `ledger`
//! }
//! ```

#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

mod cache;
mod gate;
mod ledger;

pub use cache::InMemoryCacheStore;
pub use gate::{InMemoryRateLimiter, InMemoryReplayStore};
pub use ledger::{InMemoryLedger, InMemoryUnitOfWork};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking test poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock implementations of environment traits.
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use pantry_core::environment::Clock;
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use pantry_testing::mocks::FixedClock;
    /// use pantry_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hold one handle and give
    /// another to the component under test.
    ///
    /// # Example
    ///
    /// ```
    /// use pantry_testing::mocks::ManualClock;
    /// use pantry_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let start = Utc::now();
    /// let clock = ManualClock::new(start);
    /// clock.advance(Duration::seconds(30));
    /// assert_eq!(clock.now(), start + Duration::seconds(30));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut time = super::lock(&self.time);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *super::lock(&self.time) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *super::lock(&self.time)
        }
    }
}

/// Builders for common test data.
#[allow(clippy::unwrap_used)] // Fixture inputs are literals chosen by the test author
pub mod fixtures {
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use pantry_core::types::{
        FoodItem, FoodItemId, Location, LocationId, Lot, LotId, Quantity, SlotWindow,
    };

    /// A calendar date.
    #[must_use]
    pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    /// A UTC timestamp on the hour.
    #[must_use]
    pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    /// A slot window between two hours of the same day.
    #[must_use]
    pub fn slot(day: DateTime<Utc>, from_hour: i64, to_hour: i64) -> SlotWindow {
        SlotWindow::new(
            day + chrono::Duration::hours(from_hour),
            day + chrono::Duration::hours(to_hour),
        )
        .unwrap()
    }

    /// An active location.
    #[must_use]
    pub fn location(id: i64, name: &str) -> Location {
        Location {
            id: LocationId::new(id),
            name: name.to_string(),
            active: true,
        }
    }

    /// A catalog item.
    #[must_use]
    pub fn food_item(id: i64, name: &str, category: &str, unit: &str, diets: &[&str]) -> FoodItem {
        FoodItem {
            id: FoodItemId::new(id),
            name: name.to_string(),
            category: category.to_string(),
            unit: unit.to_string(),
            diets: diets.iter().map(ToString::to_string).collect(),
        }
    }

    /// A lot of `item` at `location`.
    #[must_use]
    pub fn lot(id: i64, item: i64, location: i64, qty: i32, expiry: NaiveDate) -> Lot {
        Lot::new(
            LotId::new(id),
            FoodItemId::new(item),
            LocationId::new(location),
            qty,
            expiry,
        )
        .unwrap()
    }

    /// A positive quantity.
    #[must_use]
    pub fn qty(n: i32) -> Quantity {
        Quantity::new(n).unwrap()
    }
}
